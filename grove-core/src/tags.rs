//! Tag tables
//!
//! A tag is a named set of node memberships. Each client holds a tag table
//! behind an `Rc`, so sibling clients can share one table (sharedness is
//! simply `Rc::strong_count > 1`). Two names are virtual and never stored:
//! `all` matches every node, `root` matches exactly the root; add, remove,
//! and forget reject both.

use crate::node::NodeId;
use rustc_hash::{FxHashMap, FxHashSet};

/// The virtual tag matching every node
pub const TAG_ALL: &str = "all";

/// The virtual tag matching only the root
pub const TAG_ROOT: &str = "root";

/// True for the reserved tag names that are never materialized
pub fn is_virtual_tag(name: &str) -> bool {
    name == TAG_ALL || name == TAG_ROOT
}

/// Named node-membership sets
#[derive(Debug, Default)]
pub(crate) struct TagTable {
    tags: FxHashMap<String, FxHashSet<NodeId>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` to the tag, creating the tag on first use
    pub fn add(&mut self, name: &str, node: NodeId) {
        self.tags.entry(name.to_string()).or_default().insert(node);
    }

    /// Remove `node` from the tag. Returns false if the node was untagged.
    /// An emptied tag stays registered until forgotten.
    pub fn remove(&mut self, name: &str, node: NodeId) -> bool {
        match self.tags.get_mut(name) {
            Some(set) => set.remove(&node),
            None => false,
        }
    }

    /// True if `node` carries the (materialized) tag
    pub fn has(&self, name: &str, node: NodeId) -> bool {
        self.tags.get(name).is_some_and(|set| set.contains(&node))
    }

    /// Drop a tag and every membership. Returns false if unknown.
    pub fn forget(&mut self, name: &str) -> bool {
        self.tags.remove(name).is_some()
    }

    /// All materialized tag names, sorted for deterministic enumeration
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tags.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Members of a tag, sorted by id for deterministic iteration
    pub fn nodes(&self, name: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .tags
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        nodes.sort_unstable();
        nodes
    }

    /// True if the tag is registered (possibly with no members)
    pub fn is_known(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Scrub a deleted node out of every tag set
    pub fn scrub(&mut self, node: NodeId) {
        for set in self.tags.values_mut() {
            set.remove(&node);
        }
    }
}
