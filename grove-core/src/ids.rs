//! Small id newtypes
//!
//! Handle-style identifiers for clients and their trace/notifier
//! registrations. All are monotonic within their allocator and never
//! reused, so stale handles fail lookups instead of aliasing.

use std::fmt;

/// Identity of an attached tree client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// Handle to a value-trace registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(pub(crate) u64);

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace{}", self.0)
    }
}

/// Handle to a structural-event notifier registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NotifyId(pub(crate) u64);

impl fmt::Display for NotifyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notify{}", self.0)
    }
}
