//! # Grove Core
//!
//! In-memory, multi-client, ordered tree store. Nodes carry heterogeneous
//! named values; auxiliary hash indices over children and values are built
//! and dropped on demand; value traces and structural notifications are
//! delivered immediately or through a coalescing deferred queue.
//!
//! This crate provides:
//! - Core types: [`NodeId`], [`Key`], [`TreeValue`]
//! - The client/registry lifecycle: [`TreeRegistry`], [`TreeClient`]
//! - Value traces ([`TraceSpec`]) and structural notifiers ([`NotifySpec`])
//! - Traversal ([`WalkOrder`], [`WalkControl`]) and tag queries
//!
//! ## Design Principles
//!
//! 1. **Single-threaded, cooperative**: no locking; re-entrancy comes only
//!    from callbacks and the deferred queue, never preemption
//! 2. **Arena by id**: every structural link is a [`NodeId`], never a
//!    pointer; ids are unique for the life of a tree and never reused
//! 3. **Clients own their view**: traces, notifiers, and tags belong to
//!    the client; nodes and values belong to the shared core
//!
//! ## Example
//!
//! ```
//! use grove_core::{OpenFlags, TreeRegistry};
//!
//! let registry = TreeRegistry::new();
//! let tree = registry.open(Some("inventory"), OpenFlags::create())?;
//! let root = tree.root()?;
//! let item = tree.create_node(root, Some("widget"), None)?;
//! tree.set_value(item, "cost", 19i64)?;
//! assert_eq!(tree.get_value(item, "cost")?.as_long(), Some(19));
//! # Ok::<(), grove_core::TreeError>(())
//! ```

pub mod client;
pub mod error;
pub mod hashidx;
pub mod ids;
pub mod key;
pub mod node;
pub mod notify;
pub mod tags;
pub mod trace;
pub mod value;
pub mod walk;

mod core;
mod dispatch;
mod idle;
mod vstore;

// Re-export main types
pub use client::{OpenFlags, TreeClient, TreeRegistry};
pub use error::{Result, TreeError};
pub use ids::{ClientId, NotifyId, TraceId};
pub use key::{Key, KeyInterner};
pub use node::NodeId;
pub use notify::{NotifyCallback, NotifyEvent, NotifyMask, NotifySpec};
pub use tags::{is_virtual_tag, TAG_ALL, TAG_ROOT};
pub use trace::{TraceCallback, TraceEvent, TraceMask, TraceSpec};
pub use value::TreeValue;
pub use walk::{WalkControl, WalkOrder};

/// Prelude module for convenient imports
///
/// # Example
///
/// ```
/// use grove_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{OpenFlags, TreeClient, TreeRegistry};
    pub use crate::error::{Result, TreeError};
    pub use crate::node::NodeId;
    pub use crate::notify::{NotifyEvent, NotifyMask, NotifySpec};
    pub use crate::trace::{TraceEvent, TraceMask, TraceSpec};
    pub use crate::value::TreeValue;
    pub use crate::walk::{WalkControl, WalkOrder};
}
