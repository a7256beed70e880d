//! Interned field-name keys
//!
//! A `Key` is a handle to an interned string. Field names and node labels
//! are compared by identity (the interned id), never by byte content, so
//! equality checks on hot paths are a single integer compare.
//!
//! The interner is owned by a tree core, not process-global: distinct cores
//! have independent key spaces, and the interner is torn down with its core.
//! Keys are never released individually; the number of distinct field/label
//! names is bounded by the schema, not by node count.

use rustc_hash::FxHashMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Interned string handle
///
/// Carries both the interned id (identity) and a shared copy of the name
/// (cheap clones, display without interner access). Two keys from the same
/// interner are equal iff their ids are equal.
#[derive(Clone, Debug)]
pub struct Key {
    id: u32,
    name: Arc<str>,
}

impl Key {
    /// The interned id. Stable for the life of the owning core.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The key's name as a string slice
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Shared handle to the name
    pub fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }
}

// Identity semantics: id only. The name is carried for display.

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// Serialize as the bare name. There is deliberately no Deserialize: a key is
// only meaningful against the interner that issued it.
impl Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.name)
    }
}

/// Core-owned string interner
///
/// Maps names to sequential u32 ids. Lookup by `&str` allocates nothing;
/// the `Arc<str>` is allocated once per distinct name and shared by every
/// `Key` referencing it.
#[derive(Debug, Default)]
pub struct KeyInterner {
    ids: FxHashMap<Arc<str>, u32>,
    names: Vec<Arc<str>>,
}

impl KeyInterner {
    /// Create a new empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its key
    ///
    /// Returns the existing key if the name was seen before, preserving
    /// identity for every node/value referencing that name.
    pub fn intern(&mut self, name: &str) -> Key {
        if let Some(&id) = self.ids.get(name) {
            return Key {
                id,
                name: self.names[id as usize].clone(),
            };
        }
        let id = self.names.len() as u32;
        let arc: Arc<str> = Arc::from(name);
        self.ids.insert(arc.clone(), id);
        self.names.push(arc.clone());
        Key { id, name: arc }
    }

    /// Non-allocating lookup: the key if the name is already interned
    pub fn peek(&self, name: &str) -> Option<Key> {
        self.ids.get(name).map(|&id| Key {
            id,
            name: self.names[id as usize].clone(),
        })
    }

    /// Number of distinct interned names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_identity() {
        let mut interner = KeyInterner::new();
        let a = interner.intern("cost");
        let b = interner.intern("cost");
        let c = interner.intern("weight");

        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
        // Same Arc, not just equal bytes
        assert!(Arc::ptr_eq(&a.name_arc(), &b.name_arc()));
    }

    #[test]
    fn test_peek_does_not_intern() {
        let mut interner = KeyInterner::new();
        assert!(interner.peek("missing").is_none());
        assert_eq!(interner.len(), 0);

        let k = interner.intern("present");
        assert_eq!(interner.peek("present"), Some(k));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut interner = KeyInterner::new();
        assert_eq!(interner.intern("a").id(), 0);
        assert_eq!(interner.intern("b").id(), 1);
        assert_eq!(interner.intern("a").id(), 0);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_key_serializes_as_name() {
        let mut interner = KeyInterner::new();
        let k = interner.intern("label");
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"label\"");
    }
}
