//! Tree nodes
//!
//! A node is an arena resident addressed by its [`NodeId`]; parent, sibling,
//! and child relationships are stored as ids, never as pointers, so deleting
//! one node can never dangle another. Children are kept in a doubly-linked
//! sibling chain (stable ordering, position queries) with an auxiliary
//! label-keyed hash index above the high-water mark — the same hysteresis
//! rule as the value store.

use crate::hashidx::{HashIndex, IndexKey};
use crate::key::Key;
use crate::vstore::ValueStore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique node identifier
///
/// Monotonically assigned within a core and never reused, even across
/// deletions. The root is always id 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root node's id
    pub const ROOT: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl IndexKey for NodeId {
    fn bits(self) -> u64 {
        self.0
    }
}

/// Arena-resident node state
pub(crate) struct Node {
    pub id: NodeId,
    pub label: Key,
    pub parent: Option<NodeId>,
    pub prev_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub last_child: Option<NodeId>,
    pub num_children: usize,
    /// Cached distance from the root (root is 0); recomputed top-down on
    /// any move
    pub depth: u32,
    pub values: ValueStore,
    /// label key id -> child id, present only above the water line
    pub child_index: Option<HashIndex<u32, NodeId>>,
    /// Set while a trace callback on this node is running; suppresses
    /// re-entrant trace storms
    pub trace_active: bool,
}

impl Node {
    pub fn new(id: NodeId, label: Key, parent: Option<NodeId>, depth: u32) -> Self {
        Self {
            id,
            label,
            parent,
            prev_sibling: None,
            next_sibling: None,
            first_child: None,
            last_child: None,
            num_children: 0,
            depth,
            values: ValueStore::new(),
            child_index: None,
            trace_active: false,
        }
    }

    /// True if this node has no children
    pub fn is_leaf(&self) -> bool {
        self.num_children == 0
    }
}
