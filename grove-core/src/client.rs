//! Tree clients and the named-tree registry
//!
//! A [`TreeClient`] is a lightweight named view onto a shared tree core.
//! Multiple clients attached to one core see the same nodes and public
//! values while keeping independent trace registrations, notifiers, and
//! (unless explicitly shared) tag tables. The core is torn down when its
//! last client detaches.
//!
//! The [`TreeRegistry`] is the namespace that `open`/`attach` resolve
//! against; it replaces the host-interpreter association of the original
//! design with an explicit object.

use crate::core::{CoreRef, TreeCore};
use crate::dispatch;
use crate::error::{Result, TreeError};
use crate::ids::{ClientId, NotifyId, TraceId};
use crate::key::Key;
use crate::node::NodeId;
use crate::notify::{NotifyCallback, NotifyEvent, NotifyMask, NotifyReg, NotifySpec};
use crate::tags::{is_virtual_tag, TagTable, TAG_ALL, TAG_ROOT};
use crate::trace::{TraceCallback, TraceEvent, TraceMask, TraceReg, TraceSpec};
use crate::value::TreeValue;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Options for [`TreeRegistry::open`]
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenFlags {
    /// Create a new core (with a fresh root) instead of sharing an
    /// existing client's core
    pub create: bool,
    /// Give the new client a private tag table instead of sharing the
    /// source client's
    pub new_tags: bool,
}

impl OpenFlags {
    /// Flags for creating a new tree
    pub fn create() -> Self {
        Self {
            create: true,
            new_tags: false,
        }
    }
}

/// Client state behind the public handle
pub(crate) struct ClientInner {
    pub id: ClientId,
    pub name: String,
    /// None once the client has been closed
    pub core: Option<CoreRef>,
    pub read_traces: Vec<Rc<TraceReg>>,
    pub write_traces: Vec<Rc<TraceReg>>,
    pub notifiers: Vec<Rc<NotifyReg>>,
    pub tags: Rc<RefCell<TagTable>>,
    registry: Weak<RefCell<RegistryInner>>,
    next_trace: u64,
    next_notify: u64,
}

impl ClientInner {
    pub fn find_trace(&self, id: TraceId) -> Option<Rc<TraceReg>> {
        self.read_traces
            .iter()
            .chain(self.write_traces.iter())
            .find(|reg| reg.id == id)
            .cloned()
    }

    pub fn find_notifier(&self, id: NotifyId) -> Option<Rc<NotifyReg>> {
        self.notifiers.iter().find(|reg| reg.id == id).cloned()
    }
}

/// A named handle onto a shared tree
///
/// Cloning the handle aliases the same client (same traces, notifiers,
/// tags); use [`TreeRegistry::open`] to attach a distinct client.
#[derive(Clone)]
pub struct TreeClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl std::fmt::Debug for TreeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeClient").finish_non_exhaustive()
    }
}

struct RegistryInner {
    /// name -> chain of clients carrying it (sharers reuse the tree name)
    clients: FxHashMap<String, Vec<Weak<RefCell<ClientInner>>>>,
    next_client: u64,
    next_auto: u64,
}

/// Namespace of named trees
///
/// `open`, `attach`, and client lookup resolve names against one registry;
/// independent registries have fully independent name spaces.
#[derive(Clone)]
pub struct TreeRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl Default for TreeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                clients: FxHashMap::default(),
                next_client: 0,
                next_auto: 0,
            })),
        }
    }

    /// Open a tree: create a fresh core, or share the core of an existing
    /// named client.
    ///
    /// With `flags.create`, `name = None` picks the next free auto name
    /// (`tree0`, `tree1`, ...). Without `flags.create` the name must
    /// resolve to a live client; the new client shares that client's core
    /// and, unless `flags.new_tags`, its tag table.
    pub fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<TreeClient> {
        if flags.create {
            let name = match name {
                Some(n) => {
                    if self.first_live(n).is_some() {
                        return Err(TreeError::invalid(format!(
                            "a tree named \"{n}\" already exists"
                        )));
                    }
                    n.to_string()
                }
                None => self.auto_name(),
            };
            let core = Rc::new(RefCell::new(TreeCore::new(&name)?));
            let client = self.new_client(&name, core, Rc::new(RefCell::new(TagTable::new())));
            tracing::debug!(tree = %name, "opened new tree");
            Ok(client)
        } else {
            let name = name.ok_or_else(|| {
                TreeError::invalid("a tree name is required unless create is set")
            })?;
            let source = self
                .first_live(name)
                .ok_or_else(|| TreeError::not_found(format!("tree \"{name}\"")))?;
            let (core, tags) = {
                let src = source.borrow();
                let core = src.core.clone().ok_or_else(|| {
                    TreeError::not_found(format!("tree \"{name}\""))
                })?;
                (core, src.tags.clone())
            };
            let tags = if flags.new_tags {
                Rc::new(RefCell::new(TagTable::new()))
            } else {
                tags
            };
            let client = self.new_client(name, core, tags);
            tracing::debug!(tree = %name, "opened shared tree client");
            Ok(client)
        }
    }

    /// First live client registered under `name`
    pub fn client(&self, name: &str) -> Option<TreeClient> {
        self.first_live(name).map(|inner| TreeClient { inner })
    }

    /// Every name with at least one live client, sorted
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut names: Vec<String> = inner
            .clients
            .iter()
            .filter(|(_, chain)| chain.iter().any(|w| w.upgrade().is_some()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    fn first_live(&self, name: &str) -> Option<Rc<RefCell<ClientInner>>> {
        let inner = self.inner.borrow();
        inner
            .clients
            .get(name)?
            .iter()
            .find_map(|weak| weak.upgrade())
    }

    fn auto_name(&self) -> String {
        loop {
            let candidate = {
                let mut inner = self.inner.borrow_mut();
                let n = inner.next_auto;
                inner.next_auto += 1;
                format!("tree{n}")
            };
            if self.first_live(&candidate).is_none() {
                return candidate;
            }
        }
    }

    fn new_client(
        &self,
        name: &str,
        core: CoreRef,
        tags: Rc<RefCell<TagTable>>,
    ) -> TreeClient {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = ClientId(inner.next_client);
            inner.next_client += 1;
            id
        };
        let client = Rc::new(RefCell::new(ClientInner {
            id,
            name: name.to_string(),
            core: Some(core.clone()),
            read_traces: Vec::new(),
            write_traces: Vec::new(),
            notifiers: Vec::new(),
            tags,
            registry: Rc::downgrade(&self.inner),
            next_trace: 0,
            next_notify: 0,
        }));
        core.borrow_mut().add_client(id, Rc::downgrade(&client));
        self.inner
            .borrow_mut()
            .clients
            .entry(name.to_string())
            .or_default()
            .push(Rc::downgrade(&client));
        TreeClient { inner: client }
    }
}

impl TreeClient {
    // === Handle plumbing ===

    fn core(&self) -> Result<CoreRef> {
        let inner = self.inner.borrow();
        inner.core.clone().ok_or_else(|| {
            TreeError::invalid(format!(
                "client \"{}\" is not attached to a tree",
                inner.name
            ))
        })
    }

    fn cid(&self) -> ClientId {
        self.inner.borrow().id
    }

    /// The client's registered name
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// The attached tree's name
    pub fn tree_name(&self) -> Result<String> {
        Ok(self.core()?.borrow().name.clone())
    }

    /// True while the client is attached to a core
    pub fn is_attached(&self) -> bool {
        self.inner.borrow().core.is_some()
    }

    /// True if both handles alias the same client
    pub fn same_client(&self, other: &TreeClient) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// True if both clients are attached to the same core
    pub fn same_tree(&self, other: &TreeClient) -> bool {
        match (&self.inner.borrow().core, &other.inner.borrow().core) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    // === Lifecycle ===

    /// Detach from the current core and attach to the core of the client
    /// named `name`. The client's traces and notifiers are reset (they
    /// never carry over); its tag table is shared with the target unless
    /// `new_tags` is set.
    pub fn attach(&self, name: &str, new_tags: bool) -> Result<()> {
        let registry = self
            .inner
            .borrow()
            .registry
            .upgrade()
            .map(|inner| TreeRegistry { inner })
            .ok_or_else(|| TreeError::invalid("tree registry is gone"))?;
        let target = registry
            .first_live(name)
            .ok_or_else(|| TreeError::not_found(format!("tree \"{name}\"")))?;
        let (target_core, target_tags) = {
            let t = target.borrow();
            let core = t
                .core
                .clone()
                .ok_or_else(|| TreeError::not_found(format!("tree \"{name}\"")))?;
            (core, t.tags.clone())
        };

        let cid = self.cid();
        let old_core = self.inner.borrow().core.clone();
        let same_core = old_core
            .as_ref()
            .map(|c| Rc::ptr_eq(c, &target_core))
            .unwrap_or(false);

        // Pending deferred work belongs to the registrations being reset
        if let Some(old) = &old_core {
            old.borrow_mut().idle.cancel_client(cid);
        }
        if let Some(old) = &old_core {
            if !same_core {
                // Remove before the emptiness check: re-attachment to the
                // same core must never trigger a spurious teardown.
                let remaining = old.borrow_mut().remove_client(cid);
                if remaining == 0 {
                    old.borrow_mut().teardown();
                }
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.read_traces.clear();
            inner.write_traces.clear();
            inner.notifiers.clear();
            inner.tags = if new_tags {
                Rc::new(RefCell::new(TagTable::new()))
            } else {
                target_tags
            };
            inner.core = Some(target_core.clone());
        }
        if !same_core {
            target_core
                .borrow_mut()
                .add_client(cid, Rc::downgrade(&self.inner));
        }
        tracing::debug!(client = %cid, tree = %name, "client attached");
        Ok(())
    }

    /// Detach from the core, tearing it down if this was the last client.
    /// Bulk teardown frees every node without per-node notifications.
    /// Idempotent: closing a closed client is a no-op.
    pub fn close(&self) -> Result<()> {
        let cid = self.cid();
        let core = {
            let mut inner = self.inner.borrow_mut();
            inner.read_traces.clear();
            inner.write_traces.clear();
            inner.notifiers.clear();
            inner.core.take()
        };
        let Some(core) = core else { return Ok(()) };
        {
            let mut c = core.borrow_mut();
            c.idle.cancel_client(cid);
            let remaining = c.remove_client(cid);
            if remaining == 0 {
                c.teardown();
            }
        }
        // Unregister this handle's name entry
        if let Some(registry) = self.inner.borrow().registry.upgrade() {
            let mut reg = registry.borrow_mut();
            let name = self.inner.borrow().name.clone();
            if let Some(chain) = reg.clients.get_mut(&name) {
                chain.retain(|weak| match weak.upgrade() {
                    Some(rc) => !Rc::ptr_eq(&rc, &self.inner),
                    None => false,
                });
                if chain.is_empty() {
                    reg.clients.remove(&name);
                }
            }
        }
        tracing::debug!(client = %cid, "client closed");
        Ok(())
    }

    // === Node queries ===

    /// The root node's id
    pub fn root(&self) -> Result<NodeId> {
        Ok(self.core()?.borrow().root)
    }

    /// True if the node exists in the attached tree
    pub fn exists(&self, node: NodeId) -> bool {
        self.core()
            .map(|core| core.borrow().has_node(node))
            .unwrap_or(false)
    }

    /// A node's label
    pub fn label(&self, node: NodeId) -> Result<Arc<str>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.label.name_arc())
    }

    /// Cached distance from the root (root is 0)
    pub fn depth(&self, node: NodeId) -> Result<u32> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.depth)
    }

    /// Number of children
    pub fn degree(&self, node: NodeId) -> Result<usize> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.num_children)
    }

    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.parent)
    }

    pub fn first_child(&self, node: NodeId) -> Result<Option<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.first_child)
    }

    pub fn last_child(&self, node: NodeId) -> Result<Option<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.last_child)
    }

    pub fn next_sibling(&self, node: NodeId) -> Result<Option<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.next_sibling)
    }

    pub fn prev_sibling(&self, node: NodeId) -> Result<Option<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.prev_sibling)
    }

    /// Snapshot of a node's children in sibling order
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let core = self.core()?;
        let c = core.borrow();
        c.node(node)?;
        Ok(c.children_of(node))
    }

    /// Offset of the node among its siblings
    pub fn position(&self, node: NodeId) -> Result<usize> {
        self.core()?.borrow().position_of(node)
    }

    /// Find a child by label (O(1) once the child index exists)
    pub fn find_child(&self, parent: NodeId, label: &str) -> Result<Option<NodeId>> {
        self.core()?.borrow().find_child(parent, label)
    }

    pub fn is_leaf(&self, node: NodeId) -> Result<bool> {
        let core = self.core()?;
        let c = core.borrow();
        Ok(c.node(node)?.is_leaf())
    }

    pub fn is_root(&self, node: NodeId) -> Result<bool> {
        Ok(self.core()?.borrow().root == node)
    }

    /// True if `ancestor` lies strictly above `node`
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.core()
            .map(|core| core.borrow().is_ancestor(ancestor, node))
            .unwrap_or(false)
    }

    /// Next node in document (preorder) order
    pub fn next_in_order(&self, node: NodeId) -> Result<Option<NodeId>> {
        self.core()?.borrow().next_in_order(node)
    }

    /// Previous node in document (preorder) order
    pub fn prev_in_order(&self, node: NodeId) -> Result<Option<NodeId>> {
        self.core()?.borrow().prev_in_order(node)
    }

    /// Total number of nodes in the tree
    pub fn node_count(&self) -> Result<usize> {
        Ok(self.core()?.borrow().node_count())
    }

    /// High watermark of node depth (not reduced on delete)
    pub fn max_depth(&self) -> Result<u32> {
        Ok(self.core()?.borrow().max_depth())
    }

    /// Number of nodes in the subtree rooted at `node` (itself included)
    pub fn subtree_size(&self, node: NodeId) -> Result<usize> {
        self.core()?.borrow().subtree_size(node)
    }

    // === Node mutation ===

    /// Create a node under `parent`. `label = None` picks `node<id>`;
    /// `position = None` appends, otherwise the node is inserted before
    /// the child currently at that offset.
    pub fn create_node(
        &self,
        parent: NodeId,
        label: Option<&str>,
        position: Option<usize>,
    ) -> Result<NodeId> {
        let core = self.core()?;
        let id = core
            .borrow_mut()
            .create_node(parent, label, position, None)?;
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::CREATE,
                node: id,
            },
        );
        Ok(id)
    }

    /// Create a node with an explicit id (error if the id is in use)
    pub fn create_node_with_id(
        &self,
        parent: NodeId,
        label: Option<&str>,
        position: Option<usize>,
        id: u64,
    ) -> Result<NodeId> {
        let core = self.core()?;
        let id = core
            .borrow_mut()
            .create_node(parent, label, position, Some(id))?;
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::CREATE,
                node: id,
            },
        );
        Ok(id)
    }

    /// Delete a node and its whole subtree, children before parents.
    /// Every attached client's DELETE notifiers see each descendant go
    /// away before its parent. Deleting the root is invalid.
    pub fn delete_node(&self, node: NodeId) -> Result<()> {
        let core = self.core()?;
        let cid = self.cid();
        let victims = {
            let c = core.borrow();
            if node == c.root {
                return Err(TreeError::invalid(format!(
                    "cannot delete the root node of tree \"{}\"",
                    c.name
                )));
            }
            c.node(node)?;
            c.collect_postorder(node)
        };
        for victim in victims {
            if !core.borrow().has_node(victim) {
                // a notifier callback got there first
                continue;
            }
            dispatch::fire_notify(
                &core,
                cid,
                NotifyEvent {
                    event: NotifyMask::DELETE,
                    node: victim,
                },
            );
            {
                let mut c = core.borrow_mut();
                if !c.has_node(victim) {
                    continue;
                }
                c.unlink_child(victim)?;
                c.remove_node_entry(victim);
            }
            scrub_tags(&core, victim);
        }
        Ok(())
    }

    /// Move a node (with its subtree) under a new parent, before the
    /// given sibling or at the end. A node can never be moved under its
    /// own descendant.
    pub fn move_node(
        &self,
        node: NodeId,
        new_parent: NodeId,
        before: Option<NodeId>,
    ) -> Result<()> {
        let core = self.core()?;
        {
            let mut c = core.borrow_mut();
            c.node(node)?;
            c.node(new_parent)?;
            if node == c.root {
                return Err(TreeError::invalid(format!(
                    "cannot move the root node of tree \"{}\"",
                    c.name
                )));
            }
            if node == new_parent || c.is_ancestor(node, new_parent) {
                return Err(TreeError::invalid(format!(
                    "cannot move node {node} under its own descendant {new_parent}"
                )));
            }
            if let Some(b) = before {
                if b == node {
                    return Err(TreeError::invalid(format!(
                        "cannot move node {node} relative to itself"
                    )));
                }
                if c.node(b)?.parent != Some(new_parent) {
                    return Err(TreeError::invalid(format!(
                        "node {b} is not a child of node {new_parent}"
                    )));
                }
            }
            c.unlink_child(node)?;
            c.link_child(new_parent, node, before)?;
            c.recompute_depths(node)?;
        }
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::MOVE,
                node,
            },
        );
        Ok(())
    }

    /// Change a node's label
    pub fn relabel_node(&self, node: NodeId, label: &str) -> Result<()> {
        let core = self.core()?;
        {
            let mut c = core.borrow_mut();
            let key = c.intern(label);
            c.relabel(node, key)?;
        }
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::RELABEL,
                node,
            },
        );
        Ok(())
    }

    /// Reorder a node's children with a caller comparator (stable). The
    /// comparator may query the tree; no internal borrow is held while it
    /// runs.
    pub fn sort_children(
        &self,
        node: NodeId,
        mut cmp: impl FnMut(NodeId, NodeId) -> Ordering,
    ) -> Result<()> {
        let core = self.core()?;
        let mut kids = {
            let c = core.borrow();
            c.node(node)?;
            c.children_of(node)
        };
        kids.sort_by(|a, b| cmp(*a, *b));
        core.borrow_mut().sort_relink(node, &kids)?;
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::SORT,
                node,
            },
        );
        Ok(())
    }

    /// Sort children by label (ties broken by id for stability)
    pub fn sort_children_by_label(&self, node: NodeId) -> Result<()> {
        let core = self.core()?;
        let mut pairs: Vec<(Arc<str>, NodeId)> = {
            let c = core.borrow();
            c.node(node)?;
            let mut pairs = Vec::new();
            for kid in c.children_of(node) {
                pairs.push((c.node(kid)?.label.name_arc(), kid));
            }
            pairs
        };
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let order: Vec<NodeId> = pairs.into_iter().map(|(_, id)| id).collect();
        core.borrow_mut().sort_relink(node, &order)?;
        dispatch::fire_notify(
            &core,
            self.cid(),
            NotifyEvent {
                event: NotifyMask::SORT,
                node,
            },
        );
        Ok(())
    }

    // === Values ===

    /// Read a value by path (`name` or `name(elem)` for array elements).
    /// Fires READ traces. A private value owned by another client is an
    /// access error, distinct from not-found.
    pub fn get_value(&self, node: NodeId, path: &str) -> Result<TreeValue> {
        let (name, elem) = parse_value_path(path)?;
        let core = self.core()?;
        let cid = self.cid();
        let (key, payload) = {
            let c = core.borrow();
            let n = c.node(node)?;
            let key = c.peek_key(name).ok_or_else(|| {
                TreeError::not_found(value_err(name, node, &c.name))
            })?;
            let slot = n
                .values
                .find(&key)
                .ok_or_else(|| TreeError::not_found(value_err(name, node, &c.name)))?;
            let cell = n.values.cell(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(name, node, &c.name)));
            }
            let payload = match elem {
                None => cell.payload.clone(),
                Some(e) => {
                    let map = cell.payload.as_array().ok_or_else(|| {
                        TreeError::invalid(format!(
                            "value \"{name}\" on node {node} is not an array"
                        ))
                    })?;
                    map.get(e)
                        .cloned()
                        .ok_or_else(|| {
                            TreeError::not_found(format!(
                                "element \"{e}\" of array \"{name}\" on node {node}"
                            ))
                        })?
                }
            };
            (key, payload)
        };
        dispatch::fire_value_traces(&core, cid, node, &key, TraceMask::READ);
        Ok(payload)
    }

    /// Read a value by pre-resolved key. Fires READ traces.
    pub fn get_value_by_key(&self, node: NodeId, key: &Key) -> Result<TreeValue> {
        let core = self.core()?;
        let cid = self.cid();
        let payload = {
            let c = core.borrow();
            let n = c.node(node)?;
            let slot = n.values.find(key).ok_or_else(|| {
                TreeError::not_found(value_err(key.as_str(), node, &c.name))
            })?;
            let cell = n.values.cell(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(
                    key.as_str(),
                    node,
                    &c.name,
                )));
            }
            cell.payload.clone()
        };
        dispatch::fire_value_traces(&core, cid, node, key, TraceMask::READ);
        Ok(payload)
    }

    /// Write a value by path, creating it if absent. Fires WRITE traces
    /// (plus CREATE on first write). Writing `name(elem)` creates the
    /// enclosing array on demand; an existing non-array value is an error
    /// with no mutation.
    pub fn set_value(
        &self,
        node: NodeId,
        path: &str,
        value: impl Into<TreeValue>,
    ) -> Result<()> {
        let (name, elem) = parse_value_path(path)?;
        let value = value.into();
        let core = self.core()?;
        let cid = self.cid();
        let (key, mask) = {
            let mut c = core.borrow_mut();
            let key = c.intern(name);
            let tree = c.name.clone();
            let n = c.node_mut(node)?;
            let (slot, is_new) = n.values.create_or_find(&key)?;
            let cell = n.values.cell_mut(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(name, node, &tree)));
            }
            match elem {
                None => cell.payload = value,
                Some(e) => {
                    if is_new {
                        cell.payload = TreeValue::Array(BTreeMap::new());
                    }
                    let map = cell.payload.as_array_mut().ok_or_else(|| {
                        TreeError::invalid(format!(
                            "value \"{name}\" on node {node} is not an array"
                        ))
                    })?;
                    map.insert(e.to_string(), value);
                }
            }
            let mask = if is_new {
                TraceMask::WRITE | TraceMask::CREATE
            } else {
                TraceMask::WRITE
            };
            (key, mask)
        };
        dispatch::fire_value_traces(&core, cid, node, &key, mask);
        Ok(())
    }

    /// Write a value by pre-resolved key
    pub fn set_value_by_key(
        &self,
        node: NodeId,
        key: &Key,
        value: impl Into<TreeValue>,
    ) -> Result<()> {
        let value = value.into();
        let core = self.core()?;
        let cid = self.cid();
        let mask = {
            let mut c = core.borrow_mut();
            let tree = c.name.clone();
            let n = c.node_mut(node)?;
            let (slot, is_new) = n.values.create_or_find(key)?;
            let cell = n.values.cell_mut(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(
                    key.as_str(),
                    node,
                    &tree,
                )));
            }
            cell.payload = value;
            if is_new {
                TraceMask::WRITE | TraceMask::CREATE
            } else {
                TraceMask::WRITE
            }
        };
        dispatch::fire_value_traces(&core, cid, node, key, mask);
        Ok(())
    }

    /// Remove a value (or one array element). Fires UNSET traces when
    /// something was actually removed; unsetting a missing value is a
    /// silent no-op.
    pub fn unset_value(&self, node: NodeId, path: &str) -> Result<()> {
        let (name, elem) = parse_value_path(path)?;
        let core = self.core()?;
        let cid = self.cid();
        let fired = {
            let mut c = core.borrow_mut();
            let tree = c.name.clone();
            c.node(node)?;
            let Some(key) = c.peek_key(name) else {
                return Ok(());
            };
            let n = c.node_mut(node)?;
            let Some(slot) = n.values.find(&key) else {
                return Ok(());
            };
            if !n.values.cell(slot).visible_to(cid) {
                return Err(TreeError::access_denied(value_err(name, node, &tree)));
            }
            match elem {
                None => {
                    n.values.remove_slot(slot);
                    Some(key)
                }
                Some(e) => {
                    let cell = n.values.cell_mut(slot);
                    let map = cell.payload.as_array_mut().ok_or_else(|| {
                        TreeError::invalid(format!(
                            "value \"{name}\" on node {node} is not an array"
                        ))
                    })?;
                    map.remove(e).map(|_| key)
                }
            }
        };
        if let Some(key) = fired {
            dispatch::fire_value_traces(&core, cid, node, &key, TraceMask::UNSET);
        }
        Ok(())
    }

    /// Append to a value's string form, creating the value if absent
    pub fn append_value(&self, node: NodeId, path: &str, tail: &str) -> Result<()> {
        let (name, elem) = parse_value_path(path)?;
        let core = self.core()?;
        let cid = self.cid();
        let (key, mask) = {
            let mut c = core.borrow_mut();
            let key = c.intern(name);
            let tree = c.name.clone();
            let n = c.node_mut(node)?;
            let (slot, is_new) = n.values.create_or_find(&key)?;
            let cell = n.values.cell_mut(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(name, node, &tree)));
            }
            match elem {
                None => {
                    if is_new {
                        cell.payload = TreeValue::from(tail);
                    } else {
                        cell.payload.append_str(tail);
                    }
                }
                Some(e) => {
                    if is_new {
                        cell.payload = TreeValue::Array(BTreeMap::new());
                    }
                    let map = cell.payload.as_array_mut().ok_or_else(|| {
                        TreeError::invalid(format!(
                            "value \"{name}\" on node {node} is not an array"
                        ))
                    })?;
                    match map.get_mut(e) {
                        Some(v) => v.append_str(tail),
                        None => {
                            map.insert(e.to_string(), TreeValue::from(tail));
                        }
                    }
                }
            }
            let mask = if is_new {
                TraceMask::WRITE | TraceMask::CREATE
            } else {
                TraceMask::WRITE
            };
            (key, mask)
        };
        dispatch::fire_value_traces(&core, cid, node, &key, mask);
        Ok(())
    }

    /// Push onto a value's list form, creating the value if absent and
    /// promoting a scalar to a list on first append
    pub fn list_append_value(
        &self,
        node: NodeId,
        path: &str,
        item: impl Into<TreeValue>,
    ) -> Result<()> {
        let (name, elem) = parse_value_path(path)?;
        let item = item.into();
        let core = self.core()?;
        let cid = self.cid();
        let (key, mask) = {
            let mut c = core.borrow_mut();
            let key = c.intern(name);
            let tree = c.name.clone();
            let n = c.node_mut(node)?;
            let (slot, is_new) = n.values.create_or_find(&key)?;
            let cell = n.values.cell_mut(slot);
            if !cell.visible_to(cid) {
                return Err(TreeError::access_denied(value_err(name, node, &tree)));
            }
            match elem {
                None => {
                    if is_new {
                        cell.payload = TreeValue::List(vec![item]);
                    } else {
                        cell.payload.list_push(item);
                    }
                }
                Some(e) => {
                    if is_new {
                        cell.payload = TreeValue::Array(BTreeMap::new());
                    }
                    let map = cell.payload.as_array_mut().ok_or_else(|| {
                        TreeError::invalid(format!(
                            "value \"{name}\" on node {node} is not an array"
                        ))
                    })?;
                    match map.get_mut(e) {
                        Some(v) => v.list_push(item),
                        None => {
                            map.insert(e.to_string(), TreeValue::List(vec![item]));
                        }
                    }
                }
            }
            let mask = if is_new {
                TraceMask::WRITE | TraceMask::CREATE
            } else {
                TraceMask::WRITE
            };
            (key, mask)
        };
        dispatch::fire_value_traces(&core, cid, node, &key, mask);
        Ok(())
    }

    /// True if the value (or array element) exists and is visible to this
    /// client. Fires no traces.
    pub fn value_exists(&self, node: NodeId, path: &str) -> Result<bool> {
        let (name, elem) = parse_value_path(path)?;
        let core = self.core()?;
        let cid = self.cid();
        let c = core.borrow();
        let n = c.node(node)?;
        let Some(key) = c.peek_key(name) else {
            return Ok(false);
        };
        let Some(slot) = n.values.find(&key) else {
            return Ok(false);
        };
        let cell = n.values.cell(slot);
        if !cell.visible_to(cid) {
            return Ok(false);
        }
        Ok(match elem {
            None => true,
            Some(e) => cell
                .payload
                .as_array()
                .map(|map| map.contains_key(e))
                .unwrap_or(false),
        })
    }

    /// Keys of every value visible to this client, in insertion order.
    /// Values privately owned by other clients are skipped.
    pub fn value_keys(&self, node: NodeId) -> Result<Vec<Key>> {
        let core = self.core()?;
        let cid = self.cid();
        let c = core.borrow();
        Ok(c.node(node)?.values.keys_for(cid))
    }

    /// Element names of an array value, sorted
    pub fn array_names(&self, node: NodeId, name: &str) -> Result<Vec<String>> {
        let core = self.core()?;
        let cid = self.cid();
        let c = core.borrow();
        let n = c.node(node)?;
        let key = c
            .peek_key(name)
            .ok_or_else(|| TreeError::not_found(value_err(name, node, &c.name)))?;
        let slot = n
            .values
            .find(&key)
            .ok_or_else(|| TreeError::not_found(value_err(name, node, &c.name)))?;
        let cell = n.values.cell(slot);
        if !cell.visible_to(cid) {
            return Err(TreeError::access_denied(value_err(name, node, &c.name)));
        }
        let map = cell.payload.as_array().ok_or_else(|| {
            TreeError::invalid(format!("value \"{name}\" on node {node} is not an array"))
        })?;
        Ok(map.keys().cloned().collect())
    }

    /// Mark a value private to this client: other clients' reads and
    /// writes fail with an access error until it is publicized.
    pub fn privatize(&self, node: NodeId, name: &str) -> Result<()> {
        self.set_owner(node, name, true)
    }

    /// Restore universal access to a value this client owns
    pub fn publicize(&self, node: NodeId, name: &str) -> Result<()> {
        self.set_owner(node, name, false)
    }

    fn set_owner(&self, node: NodeId, name: &str, private: bool) -> Result<()> {
        let core = self.core()?;
        let cid = self.cid();
        let mut c = core.borrow_mut();
        let tree = c.name.clone();
        let key = c
            .peek_key(name)
            .ok_or_else(|| TreeError::not_found(value_err(name, node, &tree)))?;
        let n = c.node_mut(node)?;
        let slot = n
            .values
            .find(&key)
            .ok_or_else(|| TreeError::not_found(value_err(name, node, &tree)))?;
        let cell = n.values.cell_mut(slot);
        if !cell.visible_to(cid) {
            return Err(TreeError::access_denied(value_err(name, node, &tree)));
        }
        cell.owner = if private { Some(cid) } else { None };
        Ok(())
    }

    // === Tags ===

    /// Add a tag to a node. The virtual tags `all` and `root` are
    /// structurally true and cannot be added.
    pub fn add_tag(&self, node: NodeId, tag: &str) -> Result<()> {
        if is_virtual_tag(tag) {
            return Err(TreeError::invalid(format!(
                "cannot add reserved tag \"{tag}\""
            )));
        }
        let core = self.core()?;
        core.borrow().node(node)?;
        self.inner.borrow().tags.borrow_mut().add(tag, node);
        Ok(())
    }

    /// Remove a tag from a node
    pub fn remove_tag(&self, node: NodeId, tag: &str) -> Result<()> {
        if is_virtual_tag(tag) {
            return Err(TreeError::invalid(format!(
                "cannot remove reserved tag \"{tag}\""
            )));
        }
        self.inner.borrow().tags.borrow_mut().remove(tag, node);
        Ok(())
    }

    /// True if the node carries the tag. `all` matches every existing
    /// node; `root` matches only the root.
    pub fn has_tag(&self, node: NodeId, tag: &str) -> Result<bool> {
        let core = self.core()?;
        match tag {
            TAG_ALL => Ok(core.borrow().has_node(node)),
            TAG_ROOT => Ok(core.borrow().root == node),
            _ => Ok(self.inner.borrow().tags.borrow().has(tag, node)),
        }
    }

    /// Drop a tag and every membership
    pub fn forget_tag(&self, tag: &str) -> Result<()> {
        if is_virtual_tag(tag) {
            return Err(TreeError::invalid(format!(
                "cannot forget reserved tag \"{tag}\""
            )));
        }
        if !self.inner.borrow().tags.borrow_mut().forget(tag) {
            return Err(TreeError::not_found(format!("tag \"{tag}\"")));
        }
        Ok(())
    }

    /// Every tag name: the virtual pair plus this client's materialized
    /// tags, sorted
    pub fn tag_names(&self) -> Vec<String> {
        let mut names = vec![TAG_ALL.to_string(), TAG_ROOT.to_string()];
        names.extend(self.inner.borrow().tags.borrow().names());
        names
    }

    /// Nodes carrying a tag. `all` walks the whole tree preorder; `root`
    /// yields exactly the root. An unknown tag is an error, an empty tag
    /// an empty list.
    pub fn tagged_nodes(&self, tag: &str) -> Result<Vec<NodeId>> {
        let core = self.core()?;
        match tag {
            TAG_ALL => {
                let c = core.borrow();
                Ok(c.collect_preorder(c.root))
            }
            TAG_ROOT => Ok(vec![core.borrow().root]),
            _ => {
                let tags = self.inner.borrow().tags.clone();
                let tags = tags.borrow();
                if !tags.is_known(tag) {
                    return Err(TreeError::not_found(format!(
                        "tag \"{tag}\" in tree \"{}\"",
                        core.borrow().name
                    )));
                }
                Ok(tags.nodes(tag))
            }
        }
    }

    /// Replace this client's (possibly shared) tag table with a private
    /// empty one
    pub fn new_tag_table(&self) {
        self.inner.borrow_mut().tags = Rc::new(RefCell::new(TagTable::new()));
    }

    /// True if both clients share one tag table
    pub fn shares_tag_table_with(&self, other: &TreeClient) -> bool {
        Rc::ptr_eq(&self.inner.borrow().tags, &other.inner.borrow().tags)
    }

    // === Traces ===

    /// Register a value trace. The callback fires on events matching the
    /// spec's filters; a deferred trace is coalesced per (trace, node,
    /// key, flags) combination until the queue drains.
    pub fn add_trace<F>(&self, spec: TraceSpec, callback: F) -> Result<TraceId>
    where
        F: Fn(&TraceEvent) -> Result<()> + 'static,
    {
        self.core()?;
        let mut inner = self.inner.borrow_mut();
        let id = TraceId(inner.next_trace);
        inner.next_trace += 1;
        let callback: TraceCallback = Rc::new(callback);
        let reg = Rc::new(TraceReg::new(id, &spec, callback)?);
        let write_class = TraceMask::WRITE | TraceMask::CREATE | TraceMask::UNSET;
        if spec.mask.intersects(TraceMask::READ) {
            inner.read_traces.push(reg.clone());
        }
        if spec.mask.intersects(write_class) {
            inner.write_traces.push(reg);
        }
        Ok(id)
    }

    /// Remove a trace registration and cancel its pending deferred tasks
    pub fn delete_trace(&self, id: TraceId) -> Result<()> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.read_traces.len() + inner.write_traces.len();
            inner.read_traces.retain(|reg| reg.id != id);
            inner.write_traces.retain(|reg| reg.id != id);
            before != inner.read_traces.len() + inner.write_traces.len()
        };
        if !removed {
            return Err(TreeError::not_found(format!("{id}")));
        }
        if let Ok(core) = self.core() {
            core.borrow_mut().idle.cancel_trace(self.cid(), id);
        }
        Ok(())
    }

    // === Notifiers ===

    /// Register a structural-event notifier
    pub fn add_notifier<F>(&self, spec: NotifySpec, callback: F) -> Result<NotifyId>
    where
        F: Fn(&NotifyEvent) -> Result<()> + 'static,
    {
        self.core()?;
        let mut inner = self.inner.borrow_mut();
        let id = NotifyId(inner.next_notify);
        inner.next_notify += 1;
        let callback: NotifyCallback = Rc::new(callback);
        inner.notifiers.push(Rc::new(NotifyReg::new(id, &spec, callback)));
        Ok(id)
    }

    /// Remove a notifier registration and cancel its pending deferred
    /// tasks
    pub fn delete_notifier(&self, id: NotifyId) -> Result<()> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.notifiers.len();
            inner.notifiers.retain(|reg| reg.id != id);
            before != inner.notifiers.len()
        };
        if !removed {
            return Err(TreeError::not_found(format!("{id}")));
        }
        if let Ok(core) = self.core() {
            core.borrow_mut().idle.cancel_notifier(self.cid(), id);
        }
        Ok(())
    }

    // === Deferred queue ===

    /// Run every pending deferred trace/notify delivery (the host's idle
    /// point). Returns how many callbacks ran.
    pub fn drain_deferred(&self) -> Result<usize> {
        Ok(dispatch::drain(&self.core()?))
    }

    /// Number of queued deferred deliveries
    pub fn pending_deferred(&self) -> Result<usize> {
        Ok(self.core()?.borrow().idle.len())
    }

    /// Take the errors reported by trace/notify callbacks since the last
    /// call. Callback errors never abort the mutation that triggered
    /// them; they accumulate here.
    pub fn drain_callback_errors(&self) -> Result<Vec<TreeError>> {
        let core = self.core()?;
        let mut c = core.borrow_mut();
        Ok(std::mem::take(&mut c.callback_errors))
    }
}

/// Scrub a deleted node from every attached client's tag table, skipping
/// tables shared between clients (a shared table is left alone rather than
/// corrupting a sibling's view).
fn scrub_tags(core: &CoreRef, node: NodeId) {
    let handles = core.borrow().client_handles();
    for (_, handle) in handles {
        let tags = handle.borrow().tags.clone();
        if Rc::strong_count(&tags) <= 2 {
            // One count held by the client, one by this scan
            tags.borrow_mut().scrub(node);
        }
    }
}

/// Split a value path into name and optional array element:
/// `"a"` -> `("a", None)`, `"a(b)"` -> `("a", Some("b"))`.
fn parse_value_path(path: &str) -> Result<(&str, Option<&str>)> {
    match path.find('(') {
        None => {
            if path.is_empty() {
                return Err(TreeError::invalid("empty value name"));
            }
            Ok((path, None))
        }
        Some(open) => {
            if open == 0 || !path.ends_with(')') {
                return Err(TreeError::invalid(format!(
                    "malformed array path \"{path}\""
                )));
            }
            let name = &path[..open];
            let elem = &path[open + 1..path.len() - 1];
            if elem.is_empty() {
                return Err(TreeError::invalid(format!(
                    "malformed array path \"{path}\""
                )));
            }
            Ok((name, Some(elem)))
        }
    }
}

fn value_err(name: &str, node: NodeId, tree: &str) -> String {
    format!("value \"{name}\" on node {node} in tree \"{tree}\"")
}
