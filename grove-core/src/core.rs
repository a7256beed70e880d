//! Tree core: the shared backing store
//!
//! A core owns the node arena (which doubles as the node-id index), the key
//! interner, the deferred-task queue, and the list of attached clients. It
//! lives from creation until the last client detaches. All structural
//! primitives here mutate state only; trace/notify fan-out happens in
//! `dispatch` so no `RefCell` borrow is held across a callback.

use crate::error::{Result, TreeError};
use crate::hashidx::HashIndex;
use crate::ids::ClientId;
use crate::idle::IdleQueue;
use crate::key::{Key, KeyInterner};
use crate::node::{Node, NodeId};
use crate::vstore::{HIGH_WATER, LOW_WATER};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

// Defined in client.rs; the core only holds weak back-references.
use crate::client::ClientInner;

/// Shared handle to a core
pub(crate) type CoreRef = Rc<RefCell<TreeCore>>;

/// A client attachment
pub(crate) struct ClientSlot {
    pub id: ClientId,
    pub handle: Weak<RefCell<ClientInner>>,
}

/// The shared backing store of nodes
pub(crate) struct TreeCore {
    pub name: String,
    /// Node arena; the growable hash index is also the node-id index
    nodes: HashIndex<NodeId, Node>,
    pub root: NodeId,
    /// Next node id; monotonic, never reused
    next_id: u64,
    node_count: usize,
    /// High watermark of node depth (not reduced on delete)
    max_depth: u32,
    pub interner: KeyInterner,
    pub clients: Vec<ClientSlot>,
    pub idle: IdleQueue,
    /// Side channel for trace/notify callback errors
    pub callback_errors: Vec<TreeError>,
}

impl TreeCore {
    /// Create a core with a fresh root node labelled after the tree
    pub fn new(name: &str) -> Result<Self> {
        let mut interner = KeyInterner::new();
        let root_label = interner.intern(name);
        let root = NodeId::ROOT;
        let mut nodes = HashIndex::new();
        nodes.insert(root, Node::new(root, root_label, None, 0))?;
        tracing::debug!(tree = name, "created tree core");
        Ok(Self {
            name: name.to_string(),
            nodes,
            root,
            next_id: 1,
            node_count: 1,
            max_depth: 0,
            interner,
            clients: Vec::new(),
            idle: IdleQueue::new(),
            callback_errors: Vec::new(),
        })
    }

    // === Arena access ===

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| {
            TreeError::not_found(format!("node {id} in tree \"{}\"", self.name))
        })
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        match self.nodes.get_mut(id) {
            Some(n) => Ok(n),
            None => Err(TreeError::not_found(format!(
                "node {id} in tree \"{}\"",
                self.name
            ))),
        }
    }

    pub fn node_opt(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    // === Keys ===

    pub fn intern(&mut self, name: &str) -> Key {
        self.interner.intern(name)
    }

    pub fn peek_key(&self, name: &str) -> Option<Key> {
        self.interner.peek(name)
    }

    // === Creation ===

    /// Create a node under `parent`, optionally at a sibling position and
    /// with an explicit id. Returns the new node's id.
    pub fn create_node(
        &mut self,
        parent: NodeId,
        label: Option<&str>,
        position: Option<usize>,
        explicit_id: Option<u64>,
    ) -> Result<NodeId> {
        self.node(parent)?;
        let id = match explicit_id {
            Some(raw) => {
                let id = NodeId(raw);
                if self.nodes.contains(id) {
                    return Err(TreeError::invalid(format!(
                        "node id {raw} already in use in tree \"{}\"",
                        self.name
                    )));
                }
                self.next_id = self.next_id.max(raw + 1);
                id
            }
            None => {
                let id = NodeId(self.next_id);
                self.next_id += 1;
                id
            }
        };
        let label = match label {
            Some(l) => self.intern(l),
            None => {
                let default = format!("node{}", id.0);
                self.intern(&default)
            }
        };
        let depth = self.node(parent)?.depth + 1;
        self.nodes.insert(id, Node::new(id, label, None, depth))?;
        self.node_count += 1;
        self.max_depth = self.max_depth.max(depth);
        let before = match position {
            Some(pos) => self.child_at(parent, pos),
            None => None,
        };
        self.link_child(parent, id, before)?;
        tracing::trace!(tree = %self.name, node = %id, parent = %parent, "created node");
        Ok(id)
    }

    /// Child of `parent` at offset `pos` in the sibling chain
    pub fn child_at(&self, parent: NodeId, pos: usize) -> Option<NodeId> {
        let mut cur = self.node_opt(parent)?.first_child;
        for _ in 0..pos {
            cur = self.node_opt(cur?)?.next_sibling;
        }
        cur
    }

    // === Linking ===

    /// Splice `node` into `parent`'s sibling chain, before `before` or at
    /// the end, maintaining the child index.
    pub fn link_child(
        &mut self,
        parent: NodeId,
        node: NodeId,
        before: Option<NodeId>,
    ) -> Result<()> {
        if let Some(b) = before {
            if self.node(b)?.parent != Some(parent) {
                return Err(TreeError::invalid(format!(
                    "node {b} is not a child of node {parent} in tree \"{}\"",
                    self.name
                )));
            }
        }
        let label_id = self.node(node)?.label.id();
        match before {
            Some(b) => {
                let b_prev = self.node(b)?.prev_sibling;
                {
                    let n = self.node_mut(node)?;
                    n.parent = Some(parent);
                    n.prev_sibling = b_prev;
                    n.next_sibling = Some(b);
                }
                self.node_mut(b)?.prev_sibling = Some(node);
                match b_prev {
                    Some(p) => self.node_mut(p)?.next_sibling = Some(node),
                    None => self.node_mut(parent)?.first_child = Some(node),
                }
            }
            None => {
                let last = self.node(parent)?.last_child;
                {
                    let n = self.node_mut(node)?;
                    n.parent = Some(parent);
                    n.prev_sibling = last;
                    n.next_sibling = None;
                }
                match last {
                    Some(l) => self.node_mut(l)?.next_sibling = Some(node),
                    None => self.node_mut(parent)?.first_child = Some(node),
                }
                self.node_mut(parent)?.last_child = Some(node);
            }
        }
        let num = {
            let p = self.node_mut(parent)?;
            p.num_children += 1;
            p.num_children
        };
        if self.node(parent)?.child_index.is_some() {
            if let Some(idx) = self.node_mut(parent)?.child_index.as_mut() {
                idx.insert(label_id, node)?;
            }
        } else if num > HIGH_WATER {
            self.build_child_index(parent)?;
        }
        Ok(())
    }

    fn build_child_index(&mut self, parent: NodeId) -> Result<()> {
        let mut entries = Vec::new();
        let mut cur = self.node(parent)?.first_child;
        while let Some(c) = cur {
            let n = self.node(c)?;
            entries.push((n.label.id(), c));
            cur = n.next_sibling;
        }
        let mut idx = HashIndex::new();
        for (label_id, child) in entries {
            idx.insert(label_id, child)?;
        }
        tracing::trace!(tree = %self.name, parent = %parent, children = idx.len(), "child index built");
        self.node_mut(parent)?.child_index = Some(idx);
        Ok(())
    }

    /// Remove `node` from its parent's sibling chain and child index.
    /// The node itself stays in the arena (used by move and delete).
    pub fn unlink_child(&mut self, node: NodeId) -> Result<()> {
        let (parent, prev, next, label_id) = {
            let n = self.node(node)?;
            (n.parent, n.prev_sibling, n.next_sibling, n.label.id())
        };
        let parent = parent.ok_or_else(|| {
            TreeError::invalid(format!("cannot unlink the root of tree \"{}\"", self.name))
        })?;
        match prev {
            Some(p) => self.node_mut(p)?.next_sibling = next,
            None => self.node_mut(parent)?.first_child = next,
        }
        match next {
            Some(x) => self.node_mut(x)?.prev_sibling = prev,
            None => self.node_mut(parent)?.last_child = prev,
        }
        {
            let n = self.node_mut(node)?;
            n.parent = None;
            n.prev_sibling = None;
            n.next_sibling = None;
        }
        let tree = self.name.clone();
        let p = self.node_mut(parent)?;
        p.num_children -= 1;
        if let Some(idx) = p.child_index.as_mut() {
            idx.remove_where(label_id, |c| *c == node);
        }
        if p.child_index.is_some() && p.num_children < LOW_WATER {
            p.child_index = None;
            tracing::trace!(tree = %tree, parent = %parent, "child index dropped");
        }
        Ok(())
    }

    /// Drop a node's arena entry (after it was unlinked)
    pub fn remove_node_entry(&mut self, node: NodeId) {
        if self.nodes.remove(node).is_some() {
            self.node_count -= 1;
        }
    }

    /// Re-label a node, keeping the parent's child index in step
    pub fn relabel(&mut self, node: NodeId, label: Key) -> Result<()> {
        let (parent, old_id) = {
            let n = self.node(node)?;
            (n.parent, n.label.id())
        };
        if let Some(parent) = parent {
            let new_id = label.id();
            if let Some(idx) = self.node_mut(parent)?.child_index.as_mut() {
                idx.remove_where(old_id, |c| *c == node);
                idx.insert(new_id, node)?;
            }
        }
        self.node_mut(node)?.label = label;
        Ok(())
    }

    // === Queries ===

    /// True if `ancestor` lies strictly above `node`
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.node_opt(node).and_then(|n| n.parent);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.node_opt(id).and_then(|n| n.parent);
        }
        false
    }

    /// Snapshot of a node's children in sibling order
    pub fn children_of(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.node_opt(parent).and_then(|n| n.first_child);
        while let Some(c) = cur {
            out.push(c);
            cur = self.node_opt(c).and_then(|n| n.next_sibling);
        }
        out
    }

    /// Find a child of `parent` by label (O(1) when indexed). With
    /// duplicate labels the sibling chain decides when unindexed; the
    /// index returns an arbitrary duplicate.
    pub fn find_child(&self, parent: NodeId, label: &str) -> Result<Option<NodeId>> {
        let key = match self.peek_key(label) {
            Some(k) => k,
            None => {
                self.node(parent)?;
                return Ok(None);
            }
        };
        let n = self.node(parent)?;
        if let Some(idx) = &n.child_index {
            return Ok(idx.get(key.id()).copied());
        }
        let mut cur = n.first_child;
        while let Some(c) = cur {
            let child = self.node(c)?;
            if child.label == key {
                return Ok(Some(c));
            }
            cur = child.next_sibling;
        }
        Ok(None)
    }

    /// Offset of `node` in its parent's sibling chain (root is 0)
    pub fn position_of(&self, node: NodeId) -> Result<usize> {
        let mut pos = 0;
        let mut cur = self.node(node)?.prev_sibling;
        while let Some(p) = cur {
            pos += 1;
            cur = self.node(p)?.prev_sibling;
        }
        Ok(pos)
    }

    /// Next node in document (preorder) order
    pub fn next_in_order(&self, node: NodeId) -> Result<Option<NodeId>> {
        if let Some(c) = self.node(node)?.first_child {
            return Ok(Some(c));
        }
        let mut cur = node;
        loop {
            let n = self.node(cur)?;
            if let Some(s) = n.next_sibling {
                return Ok(Some(s));
            }
            match n.parent {
                Some(p) => cur = p,
                None => return Ok(None),
            }
        }
    }

    /// Previous node in document (preorder) order
    pub fn prev_in_order(&self, node: NodeId) -> Result<Option<NodeId>> {
        let n = self.node(node)?;
        match n.prev_sibling {
            None => Ok(n.parent),
            Some(mut cur) => {
                while let Some(last) = self.node(cur)?.last_child {
                    cur = last;
                }
                Ok(Some(cur))
            }
        }
    }

    /// Postorder id snapshot of the subtree rooted at `start`
    pub fn collect_postorder(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            let mut kids = self.children_of(id);
            while let Some(k) = kids.pop() {
                stack.push((k, false));
            }
        }
        out
    }

    /// Preorder id snapshot of the subtree rooted at `start`
    pub fn collect_preorder(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut kids = self.children_of(id);
            while let Some(k) = kids.pop() {
                stack.push(k);
            }
        }
        out
    }

    /// Number of nodes in the subtree rooted at `node` (itself included)
    pub fn subtree_size(&self, node: NodeId) -> Result<usize> {
        self.node(node)?;
        Ok(self.collect_preorder(node).len())
    }

    /// Recompute cached depths of the subtree rooted at `start`, top-down
    pub fn recompute_depths(&mut self, start: NodeId) -> Result<()> {
        let base = match self.node(start)?.parent {
            Some(p) => self.node(p)?.depth + 1,
            None => 0,
        };
        let mut stack = vec![(start, base)];
        while let Some((id, depth)) = stack.pop() {
            self.node_mut(id)?.depth = depth;
            self.max_depth = self.max_depth.max(depth);
            for k in self.children_of(id) {
                stack.push((k, depth + 1));
            }
        }
        Ok(())
    }

    /// Rebuild `parent`'s sibling chain in the given order. Ids that no
    /// longer are children of `parent` (a comparator callback may have
    /// mutated the tree) are dropped from the chain.
    pub fn sort_relink(&mut self, parent: NodeId, order: &[NodeId]) -> Result<()> {
        self.node(parent)?;
        let valid: Vec<NodeId> = order
            .iter()
            .copied()
            .filter(|id| {
                self.node_opt(*id)
                    .map(|n| n.parent == Some(parent))
                    .unwrap_or(false)
            })
            .collect();
        for (i, id) in valid.iter().enumerate() {
            let prev = if i == 0 { None } else { Some(valid[i - 1]) };
            let next = valid.get(i + 1).copied();
            let n = self.node_mut(*id)?;
            n.prev_sibling = prev;
            n.next_sibling = next;
        }
        let p = self.node_mut(parent)?;
        p.first_child = valid.first().copied();
        p.last_child = valid.last().copied();
        p.num_children = valid.len();
        Ok(())
    }

    // === Clients ===

    pub fn add_client(&mut self, id: ClientId, handle: Weak<RefCell<ClientInner>>) {
        self.clients.push(ClientSlot { id, handle });
    }

    /// Remove a client from the attachment list, returning how many remain
    pub fn remove_client(&mut self, id: ClientId) -> usize {
        self.clients.retain(|slot| slot.id != id);
        self.clients.len()
    }

    /// Live client handles, in attachment order
    pub fn client_handles(&self) -> Vec<(ClientId, Rc<RefCell<ClientInner>>)> {
        self.clients
            .iter()
            .filter_map(|slot| slot.handle.upgrade().map(|rc| (slot.id, rc)))
            .collect()
    }

    pub fn client_by_id(&self, id: ClientId) -> Option<Rc<RefCell<ClientInner>>> {
        self.clients
            .iter()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.handle.upgrade())
    }

    /// Bulk teardown: free every node without per-node notification.
    /// Runs only once the client list is empty.
    pub fn teardown(&mut self) {
        tracing::debug!(
            tree = %self.name,
            nodes = self.node_count,
            "tearing down tree core"
        );
        self.nodes = HashIndex::new();
        self.node_count = 0;
        self.idle.clear();
        self.callback_errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vstore::{HIGH_WATER, LOW_WATER};

    fn core() -> TreeCore {
        TreeCore::new("t").unwrap()
    }

    #[test]
    fn test_child_index_hysteresis() {
        let mut c = core();
        let root = c.root;
        let mut kids = Vec::new();
        for i in 0..HIGH_WATER {
            kids.push(c.create_node(root, Some(&format!("c{i}")), None, None).unwrap());
        }
        assert!(c.node(root).unwrap().child_index.is_none());

        // One past the high-water mark builds the index
        kids.push(
            c.create_node(root, Some(&format!("c{HIGH_WATER}")), None, None)
                .unwrap(),
        );
        assert!(c.node(root).unwrap().child_index.is_some());
        assert_eq!(c.find_child(root, "c3").unwrap(), Some(kids[3]));

        // Deleting down to the low-water mark keeps the index
        while c.node(root).unwrap().num_children > LOW_WATER {
            let victim = kids.remove(0);
            c.unlink_child(victim).unwrap();
            c.remove_node_entry(victim);
        }
        assert!(c.node(root).unwrap().child_index.is_some());

        // One below drops it; lookups still work off the chain
        let victim = kids.remove(0);
        c.unlink_child(victim).unwrap();
        c.remove_node_entry(victim);
        assert!(c.node(root).unwrap().child_index.is_none());
        let last = *kids.last().unwrap();
        assert_eq!(
            c.find_child(root, &format!("c{HIGH_WATER}")).unwrap(),
            Some(last)
        );
    }

    #[test]
    fn test_ids_never_reused() {
        let mut c = core();
        let root = c.root;
        let a = c.create_node(root, Some("a"), None, None).unwrap();
        c.unlink_child(a).unwrap();
        c.remove_node_entry(a);
        let b = c.create_node(root, Some("b"), None, None).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_explicit_id_bumps_counter() {
        let mut c = core();
        let root = c.root;
        let big = c.create_node(root, None, None, Some(100)).unwrap();
        assert_eq!(big, NodeId(100));
        assert!(c.create_node(root, None, None, Some(100)).is_err());
        let next = c.create_node(root, None, None, None).unwrap();
        assert_eq!(next, NodeId(101));
    }

    #[test]
    fn test_position_insertion() {
        let mut c = core();
        let root = c.root;
        let a = c.create_node(root, Some("a"), None, None).unwrap();
        let b = c.create_node(root, Some("b"), None, None).unwrap();
        // Insert at offset 1: lands between a and b
        let mid = c.create_node(root, Some("mid"), Some(1), None).unwrap();
        assert_eq!(c.children_of(root), vec![a, mid, b]);
        assert_eq!(c.position_of(mid).unwrap(), 1);
        // Out-of-range position appends
        let tail = c.create_node(root, Some("tail"), Some(99), None).unwrap();
        assert_eq!(c.children_of(root), vec![a, mid, b, tail]);
    }

    #[test]
    fn test_depth_recompute_on_relink() {
        let mut c = core();
        let root = c.root;
        let a = c.create_node(root, Some("a"), None, None).unwrap();
        let b = c.create_node(root, Some("b"), None, None).unwrap();
        let b1 = c.create_node(b, Some("b1"), None, None).unwrap();
        assert_eq!(c.node(b1).unwrap().depth, 2);

        // Move b (with b1) under a
        c.unlink_child(b).unwrap();
        c.link_child(a, b, None).unwrap();
        c.recompute_depths(b).unwrap();
        assert_eq!(c.node(b).unwrap().depth, 2);
        assert_eq!(c.node(b1).unwrap().depth, 3);
        assert_eq!(c.max_depth(), 3);
    }

    #[test]
    fn test_relabel_keeps_index_in_step() {
        let mut c = core();
        let root = c.root;
        for i in 0..=HIGH_WATER {
            c.create_node(root, Some(&format!("c{i}")), None, None).unwrap();
        }
        assert!(c.node(root).unwrap().child_index.is_some());
        let target = c.find_child(root, "c4").unwrap().unwrap();
        let key = c.intern("renamed");
        c.relabel(target, key).unwrap();
        assert_eq!(c.find_child(root, "c4").unwrap(), None);
        assert_eq!(c.find_child(root, "renamed").unwrap(), Some(target));
    }
}
