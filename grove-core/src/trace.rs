//! Value traces
//!
//! A trace registration matches (optional node, optional key glob, optional
//! tag) against read/write/create/unset events on values and delivers a
//! callback either immediately or deferred through the core's idle queue
//! (coalesced per distinct (trace, node, key, flags) combination).
//!
//! Key patterns are shell-style globs (`*`, `?`, `[...]`), compiled to an
//! anchored regex at registration time.

use crate::error::{Result, TreeError};
use crate::ids::{ClientId, TraceId};
use crate::key::Key;
use crate::node::NodeId;
use crate::tags::{TagTable, TAG_ALL, TAG_ROOT};
use regex::Regex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

/// Bit mask of value-event kinds
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceMask(u8);

impl TraceMask {
    /// Value was read
    pub const READ: TraceMask = TraceMask(0b0001);
    /// Value was written
    pub const WRITE: TraceMask = TraceMask(0b0010);
    /// Value was created
    pub const CREATE: TraceMask = TraceMask(0b0100);
    /// Value was removed
    pub const UNSET: TraceMask = TraceMask(0b1000);
    /// Every event kind
    pub const ALL: TraceMask = TraceMask(0b1111);

    /// Empty mask
    pub const fn empty() -> TraceMask {
        TraceMask(0)
    }

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: TraceMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the two masks share any bit
    pub fn intersects(self, other: TraceMask) -> bool {
        self.0 & other.0 != 0
    }

    /// The shared bits
    pub fn intersection(self, other: TraceMask) -> TraceMask {
        TraceMask(self.0 & other.0)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for TraceMask {
    type Output = TraceMask;
    fn bitor(self, rhs: TraceMask) -> TraceMask {
        TraceMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TraceMask {
    fn bitor_assign(&mut self, rhs: TraceMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TraceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(TraceMask::READ) {
            names.push("READ");
        }
        if self.contains(TraceMask::WRITE) {
            names.push("WRITE");
        }
        if self.contains(TraceMask::CREATE) {
            names.push("CREATE");
        }
        if self.contains(TraceMask::UNSET) {
            names.push("UNSET");
        }
        write!(f, "TraceMask({})", names.join("|"))
    }
}

/// Payload delivered to a trace callback
#[derive(Clone, Debug)]
pub struct TraceEvent {
    /// The node carrying the value
    pub node: NodeId,
    /// The value's key
    pub key: Key,
    /// Which event bits fired
    pub mask: TraceMask,
}

/// Trace callback. Errors never abort the triggering mutation; they are
/// diverted to the core's callback-error channel.
pub type TraceCallback = Rc<dyn Fn(&TraceEvent) -> Result<()>>;

/// Filter and delivery options for a trace registration
#[derive(Clone, Debug)]
pub struct TraceSpec {
    /// Only fire for this node (None = any node)
    pub node: Option<NodeId>,
    /// Only fire for keys matching this glob (None = any key)
    pub pattern: Option<String>,
    /// Only fire for nodes carrying this tag in the registering client's
    /// table (None = no tag filter)
    pub tag: Option<String>,
    /// Event kinds to fire on
    pub mask: TraceMask,
    /// Suppress events originating from the registering client itself
    pub foreign_only: bool,
    /// Deliver through the idle queue (coalesced) instead of synchronously
    pub deferred: bool,
}

impl Default for TraceSpec {
    fn default() -> Self {
        Self {
            node: None,
            pattern: None,
            tag: None,
            mask: TraceMask::ALL,
            foreign_only: false,
            deferred: false,
        }
    }
}

/// A registered trace
pub(crate) struct TraceReg {
    pub id: TraceId,
    pub node: Option<NodeId>,
    pub pattern: Option<Regex>,
    pub tag: Option<String>,
    pub mask: TraceMask,
    pub foreign_only: bool,
    pub deferred: bool,
    pub callback: TraceCallback,
}

impl TraceReg {
    pub fn new(id: TraceId, spec: &TraceSpec, callback: TraceCallback) -> Result<Self> {
        let pattern = match &spec.pattern {
            Some(glob) => Some(compile_glob(glob)?),
            None => None,
        };
        Ok(Self {
            id,
            node: spec.node,
            pattern,
            tag: spec.tag.clone(),
            mask: spec.mask,
            foreign_only: spec.foreign_only,
            deferred: spec.deferred,
            callback,
        })
    }

    /// Does this registration fire for the given event?
    ///
    /// `owner` is the registering client, `origin` the client performing
    /// the mutation, `root` the tree's root (for the virtual `root` tag),
    /// `tags` the registering client's tag table.
    pub fn matches(
        &self,
        owner: ClientId,
        origin: ClientId,
        node: NodeId,
        key: &Key,
        mask: TraceMask,
        root: NodeId,
        tags: &TagTable,
    ) -> bool {
        if !self.mask.intersects(mask) {
            return false;
        }
        if let Some(only) = self.node {
            if only != node {
                return false;
            }
        }
        if self.foreign_only && origin == owner {
            return false;
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(key.as_str()) {
                return false;
            }
        }
        match self.tag.as_deref() {
            None => true,
            Some(TAG_ALL) => true,
            Some(TAG_ROOT) => node == root,
            Some(tag) => tags.has(tag, node),
        }
    }
}

/// Compile a shell-style glob into an anchored regex
pub(crate) fn compile_glob(glob: &str) -> Result<Regex> {
    let mut re = String::with_capacity(glob.len() + 4);
    re.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        re.push(']');
                        break;
                    }
                    if matches!(inner, '\\' | '^') {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                if !closed {
                    return Err(TreeError::invalid(format!(
                        "unterminated character class in key pattern \"{glob}\""
                    )));
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| TreeError::invalid(format!("bad key pattern \"{glob}\": {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let rw = TraceMask::READ | TraceMask::WRITE;
        assert!(rw.contains(TraceMask::READ));
        assert!(!rw.contains(TraceMask::UNSET));
        assert!(rw.intersects(TraceMask::WRITE | TraceMask::CREATE));
        assert!(!rw.intersects(TraceMask::UNSET));
        assert_eq!(
            rw.intersection(TraceMask::WRITE | TraceMask::UNSET),
            TraceMask::WRITE
        );
    }

    #[test]
    fn test_glob_literal_and_star() {
        let re = compile_glob("name*").unwrap();
        assert!(re.is_match("name"));
        assert!(re.is_match("name.first"));
        assert!(!re.is_match("a.name"));

        let re = compile_glob("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("aXb")); // dot is literal
    }

    #[test]
    fn test_glob_question_and_class() {
        let re = compile_glob("c?st").unwrap();
        assert!(re.is_match("cost"));
        assert!(re.is_match("cast"));
        assert!(!re.is_match("coast"));

        let re = compile_glob("k[0-3]").unwrap();
        assert!(re.is_match("k2"));
        assert!(!re.is_match("k7"));

        let re = compile_glob("k[!0-3]").unwrap();
        assert!(!re.is_match("k2"));
        assert!(re.is_match("k7"));
    }

    #[test]
    fn test_glob_unterminated_class() {
        assert!(compile_glob("k[0-3").is_err());
    }
}
