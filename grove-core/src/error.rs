//! Error types for grove-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, TreeError>;

/// Core error type
///
/// The taxonomy is deliberately small: callers dispatch on the class, and
/// the message carries the diagnosable detail (node id, key name, tree name).
#[derive(Error, Debug, Clone)]
pub enum TreeError {
    /// Missing node, value, tag, or key
    #[error("not found: {0}")]
    NotFound(String),

    /// Private value owned by a different client
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Structurally invalid request (cycles, root deletion, virtual tags, ...)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Index/arena growth failure. Unrecoverable; surfaced rather than
    /// aborting so embedders can decide how to die.
    #[error("allocation failure: {0}")]
    Allocation(String),
}

impl TreeError {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        TreeError::NotFound(msg.into())
    }

    /// Create an access-denied error
    pub fn access_denied(msg: impl Into<String>) -> Self {
        TreeError::AccessDenied(msg.into())
    }

    /// Create an invalid-operation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        TreeError::InvalidOperation(msg.into())
    }

    /// Create an allocation-failure error
    pub fn allocation(msg: impl Into<String>) -> Self {
        TreeError::Allocation(msg.into())
    }

    /// True for the `NotFound` class
    pub fn is_not_found(&self) -> bool {
        matches!(self, TreeError::NotFound(_))
    }

    /// True for the `AccessDenied` class
    pub fn is_access_denied(&self) -> bool {
        matches!(self, TreeError::AccessDenied(_))
    }
}
