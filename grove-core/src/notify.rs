//! Structural-event notifications
//!
//! Notifiers observe create/delete/move/sort/relabel events on the whole
//! tree. Every attached client's handlers run, including the originator's,
//! unless a handler opted into foreign-only delivery. A handler that is
//! currently executing is skipped (no re-entrant cascades). Deferred
//! handlers coalesce into a single pending idle task, the payload
//! overwritten with the most recent event.

use crate::error::Result;
use crate::ids::NotifyId;
use crate::node::NodeId;
use std::cell::Cell;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

/// Bit mask of structural-event kinds
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyMask(u8);

impl NotifyMask {
    /// A node was created
    pub const CREATE: NotifyMask = NotifyMask(0b0000_0001);
    /// A node is being deleted
    pub const DELETE: NotifyMask = NotifyMask(0b0000_0010);
    /// A node was moved
    pub const MOVE: NotifyMask = NotifyMask(0b0000_0100);
    /// A node's children were reordered
    pub const SORT: NotifyMask = NotifyMask(0b0000_1000);
    /// A node was relabelled
    pub const RELABEL: NotifyMask = NotifyMask(0b0001_0000);
    /// Every event kind
    pub const ALL: NotifyMask = NotifyMask(0b0001_1111);

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: NotifyMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the two masks share any bit
    pub fn intersects(self, other: NotifyMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for NotifyMask {
    type Output = NotifyMask;
    fn bitor(self, rhs: NotifyMask) -> NotifyMask {
        NotifyMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for NotifyMask {
    fn bitor_assign(&mut self, rhs: NotifyMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for NotifyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(NotifyMask::CREATE) {
            names.push("CREATE");
        }
        if self.contains(NotifyMask::DELETE) {
            names.push("DELETE");
        }
        if self.contains(NotifyMask::MOVE) {
            names.push("MOVE");
        }
        if self.contains(NotifyMask::SORT) {
            names.push("SORT");
        }
        if self.contains(NotifyMask::RELABEL) {
            names.push("RELABEL");
        }
        write!(f, "NotifyMask({})", names.join("|"))
    }
}

/// Payload delivered to a notifier callback
///
/// Carries the node id rather than node state: for DELETE the node may be
/// gone by the time a deferred handler runs.
#[derive(Clone, Copy, Debug)]
pub struct NotifyEvent {
    /// The event kind (a single mask bit)
    pub event: NotifyMask,
    /// The affected node
    pub node: NodeId,
}

/// Notifier callback. Errors are diverted to the core's callback-error
/// channel, never aborting the triggering mutation.
pub type NotifyCallback = Rc<dyn Fn(&NotifyEvent) -> Result<()>>;

/// Filter and delivery options for a notifier registration
#[derive(Clone, Debug)]
pub struct NotifySpec {
    /// Event kinds to fire on
    pub mask: NotifyMask,
    /// Suppress events originating from the registering client itself
    pub foreign_only: bool,
    /// Deliver through the idle queue (latest event wins)
    pub deferred: bool,
}

impl Default for NotifySpec {
    fn default() -> Self {
        Self {
            mask: NotifyMask::ALL,
            foreign_only: false,
            deferred: false,
        }
    }
}

/// A registered notifier
pub(crate) struct NotifyReg {
    pub id: NotifyId,
    pub mask: NotifyMask,
    pub foreign_only: bool,
    pub deferred: bool,
    /// Set while the callback is executing; re-entrant events skip it
    pub active: Cell<bool>,
    pub callback: NotifyCallback,
}

impl NotifyReg {
    pub fn new(id: NotifyId, spec: &NotifySpec, callback: NotifyCallback) -> Self {
        Self {
            id,
            mask: spec.mask,
            foreign_only: spec.foreign_only,
            deferred: spec.deferred,
            active: Cell::new(false),
            callback,
        }
    }
}
