//! # Grove Select
//!
//! Textual node selectors for grove trees. A selector names a starting
//! node — a numeric id, the reserved words `root` / `all`, or a tag — and
//! optionally walks from it through a chain of `->` modifiers:
//!
//! ```text
//! 12
//! root
//! root->firstchild->next
//! mytag->parent
//! root->"a label with spaces"->lastchild
//! ```
//!
//! Modifiers: `parent`, `firstchild`, `lastchild`, `next`, `nextsibling`,
//! `previous`, `prevsibling`, a quoted or bare child label, or a numeric
//! node id.
//!
//! [`resolve_one`] requires the selector to name exactly one node (a tag
//! matching several nodes is an error); [`resolve_all`] yields every
//! match. Resolution failures name the unresolved token and the tree for
//! diagnosability.

pub mod parse;
pub mod resolve;

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, SelectError>;

/// Selector errors
#[derive(Error, Debug)]
pub enum SelectError {
    /// The selector text itself is malformed
    #[error("selector syntax error at \"{token}\": {reason}")]
    Syntax { token: String, reason: String },

    /// A token failed to resolve to a node
    #[error("cannot resolve \"{token}\" in tree \"{tree}\"")]
    Unresolved { token: String, tree: String },

    /// A tag matched several nodes where exactly one was required
    #[error(
        "tag \"{token}\" matches {count} nodes in tree \"{tree}\" where exactly one is required"
    )]
    Ambiguous {
        token: String,
        count: usize,
        tree: String,
    },

    /// An underlying tree error
    #[error(transparent)]
    Tree(#[from] grove_core::TreeError),
}

impl SelectError {
    pub(crate) fn syntax(token: impl Into<String>, reason: impl Into<String>) -> Self {
        SelectError::Syntax {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unresolved(token: impl Into<String>, tree: impl Into<String>) -> Self {
        SelectError::Unresolved {
            token: token.into(),
            tree: tree.into(),
        }
    }
}

pub use parse::{parse, Base, Modifier, Selector};
pub use resolve::{resolve_all, resolve_one};
