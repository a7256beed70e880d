//! Selector grammar and parser
//!
//! A selector is `base[->modifier]*`. The separator is a literal `->`;
//! quoted segments may contain one (or spaces) without splitting. Parsing
//! never touches a tree — resolution happens in [`crate::resolve`].

use crate::{Result, SelectError};

/// Starting point of a selector chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Base {
    /// Bare non-negative integer: a node id
    Id(u64),
    /// The reserved word `root`
    Root,
    /// The reserved word `all`
    All,
    /// A registered tag name
    Tag(String),
}

/// One `->` step applied to the current node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modifier {
    /// `parent`
    Parent,
    /// `firstchild`
    FirstChild,
    /// `lastchild`
    LastChild,
    /// `next`: next node in document order
    Next,
    /// `nextsibling`
    NextSibling,
    /// `previous`: previous node in document order
    Previous,
    /// `prevsibling`
    PrevSibling,
    /// A quoted or bare child label
    Label(String),
    /// A numeric node id (jump)
    Id(u64),
}

/// A parsed selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    pub base: Base,
    pub modifiers: Vec<Modifier>,
}

/// Parse a selector string
pub fn parse(input: &str) -> Result<Selector> {
    let segments = split_segments(input)?;
    let mut iter = segments.into_iter();
    let head = match iter.next() {
        Some(h) if !h.is_empty() => h,
        _ => return Err(SelectError::syntax(input, "empty selector")),
    };
    let base = parse_base(&head);
    let mut modifiers = Vec::new();
    for seg in iter {
        if seg.is_empty() {
            return Err(SelectError::syntax(input, "empty modifier"));
        }
        modifiers.push(parse_modifier(&seg));
    }
    Ok(Selector { base, modifiers })
}

/// Split on `->`, honoring double quotes
fn split_segments(input: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '-' if !in_quotes && chars.peek() == Some(&'>') => {
                chars.next();
                segments.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(SelectError::syntax(input, "unterminated quote"));
    }
    segments.push(current.trim().to_string());
    Ok(segments)
}

fn parse_base(token: &str) -> Base {
    if let Some(id) = as_id(token) {
        return Base::Id(id);
    }
    match token {
        "root" => Base::Root,
        "all" => Base::All,
        _ => Base::Tag(unquote(token)),
    }
}

fn parse_modifier(token: &str) -> Modifier {
    if token.starts_with('"') {
        return Modifier::Label(unquote(token));
    }
    if let Some(id) = as_id(token) {
        return Modifier::Id(id);
    }
    match token {
        "parent" => Modifier::Parent,
        "firstchild" => Modifier::FirstChild,
        "lastchild" => Modifier::LastChild,
        "next" => Modifier::Next,
        "nextsibling" => Modifier::NextSibling,
        "previous" => Modifier::Previous,
        "prevsibling" => Modifier::PrevSibling,
        other => Modifier::Label(other.to_string()),
    }
}

fn as_id(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn unquote(token: &str) -> String {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        token[1..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bases() {
        assert_eq!(parse("42").unwrap().base, Base::Id(42));
        assert_eq!(parse("root").unwrap().base, Base::Root);
        assert_eq!(parse("all").unwrap().base, Base::All);
        assert_eq!(parse("hot").unwrap().base, Base::Tag("hot".to_string()));
    }

    #[test]
    fn test_modifier_chain() {
        let s = parse("root->firstchild->next->7").unwrap();
        assert_eq!(s.base, Base::Root);
        assert_eq!(
            s.modifiers,
            vec![Modifier::FirstChild, Modifier::Next, Modifier::Id(7)]
        );
    }

    #[test]
    fn test_quoted_label_keeps_arrow() {
        let s = parse("root->\"odd -> label\"->parent").unwrap();
        assert_eq!(
            s.modifiers,
            vec![
                Modifier::Label("odd -> label".to_string()),
                Modifier::Parent
            ]
        );
    }

    #[test]
    fn test_bare_label_modifier() {
        let s = parse("root->widgets").unwrap();
        assert_eq!(s.modifiers, vec![Modifier::Label("widgets".to_string())]);
    }

    #[test]
    fn test_reserved_word_as_quoted_label() {
        // Quoting forces label interpretation even for keywords
        let s = parse("root->\"parent\"").unwrap();
        assert_eq!(s.modifiers, vec![Modifier::Label("parent".to_string())]);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("root->").is_err());
        assert!(parse("root->\"unterminated").is_err());
    }
}
