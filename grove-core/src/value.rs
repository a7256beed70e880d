//! TreeValue - polymorphic node value payload
//!
//! The payload slot of a named value can hold scalars, lists, or an
//! "array": a nested string-keyed map whose elements are addressed with the
//! `name(elem)` path syntax. Array elements are mutated through a secondary
//! path that still fires the traces of the enclosing value; traces are
//! value-granular, not element-granular.
//!
//! ## Serde
//!
//! Serializes untagged: scalars as themselves, lists as JSON arrays, arrays
//! as JSON objects. `Long` precedes `Double` so integral JSON numbers
//! deserialize as `Long`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Polymorphic value payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeValue {
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Long(i64),
    /// 64-bit floating point
    Double(f64),
    /// String value (shared, cheap clones)
    String(Arc<str>),
    /// Ordered list of values
    List(Vec<TreeValue>),
    /// Nested string-keyed map ("array" value kind)
    Array(BTreeMap<String, TreeValue>),
}

impl TreeValue {
    /// Human-readable kind name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            TreeValue::Bool(_) => "bool",
            TreeValue::Long(_) => "long",
            TreeValue::Double(_) => "double",
            TreeValue::String(_) => "string",
            TreeValue::List(_) => "list",
            TreeValue::Array(_) => "array",
        }
    }

    /// True for the `Array` kind
    pub fn is_array(&self) -> bool {
        matches!(self, TreeValue::Array(_))
    }

    /// Boolean payload, if that is the kind
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TreeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload, if that is the kind
    pub fn as_long(&self) -> Option<i64> {
        match self {
            TreeValue::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric payload widened to f64 (Long or Double)
    pub fn as_double(&self) -> Option<f64> {
        match self {
            TreeValue::Long(n) => Some(*n as f64),
            TreeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// String payload, if that is the kind
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TreeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// List payload, if that is the kind
    pub fn as_list(&self) -> Option<&[TreeValue]> {
        match self {
            TreeValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Array payload, if that is the kind
    pub fn as_array(&self) -> Option<&BTreeMap<String, TreeValue>> {
        match self {
            TreeValue::Array(map) => Some(map),
            _ => None,
        }
    }

    /// Mutable array payload, if that is the kind
    pub fn as_array_mut(&mut self) -> Option<&mut BTreeMap<String, TreeValue>> {
        match self {
            TreeValue::Array(map) => Some(map),
            _ => None,
        }
    }

    /// Append to the string representation, converting other kinds to
    /// their display form first (string-append semantics).
    pub fn append_str(&mut self, tail: &str) {
        let mut s = match self {
            TreeValue::String(s) => s.to_string(),
            ref other => other.to_string(),
        };
        s.push_str(tail);
        *self = TreeValue::String(Arc::from(s.as_str()));
    }

    /// Push onto a list, promoting a scalar to a one-element list first
    /// (list-append semantics).
    pub fn list_push(&mut self, item: TreeValue) {
        match self {
            TreeValue::List(items) => items.push(item),
            other => {
                let head = other.clone();
                *other = TreeValue::List(vec![head, item]);
            }
        }
    }
}

impl fmt::Display for TreeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeValue::Bool(b) => write!(f, "{b}"),
            TreeValue::Long(n) => write!(f, "{n}"),
            TreeValue::Double(d) => write!(f, "{d}"),
            TreeValue::String(s) => f.write_str(s),
            TreeValue::List(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            TreeValue::Array(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{k} {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for TreeValue {
    fn from(b: bool) -> Self {
        TreeValue::Bool(b)
    }
}

impl From<i64> for TreeValue {
    fn from(n: i64) -> Self {
        TreeValue::Long(n)
    }
}

impl From<f64> for TreeValue {
    fn from(d: f64) -> Self {
        TreeValue::Double(d)
    }
}

impl From<&str> for TreeValue {
    fn from(s: &str) -> Self {
        TreeValue::String(Arc::from(s))
    }
}

impl From<String> for TreeValue {
    fn from(s: String) -> Self {
        TreeValue::String(Arc::from(s.as_str()))
    }
}

impl From<Vec<TreeValue>> for TreeValue {
    fn from(items: Vec<TreeValue>) -> Self {
        TreeValue::List(items)
    }
}
