//! Selector resolution against a tree client
//!
//! The base token resolves through the client's view (ids, the root, the
//! client's tag table), then each `->` modifier is applied left to right.
//! Failures carry the offending token and the tree name.

use crate::parse::{parse, Base, Modifier, Selector};
use crate::{Result, SelectError};
use grove_core::{NodeId, TreeClient, TreeError, TAG_ALL};

/// Resolve a selector that must name exactly one node
pub fn resolve_one(client: &TreeClient, input: &str) -> Result<NodeId> {
    let selector = parse(input)?;
    let tree = client.tree_name()?;
    let node = resolve_base_one(client, &selector, &tree)?;
    apply_modifiers(client, node, &selector.modifiers, &tree)
}

/// Resolve a selector to every matching node
///
/// A bare tag (or `all`) yields its whole member set; anything with
/// modifiers must still name exactly one node.
pub fn resolve_all(client: &TreeClient, input: &str) -> Result<Vec<NodeId>> {
    let selector = parse(input)?;
    let tree = client.tree_name()?;
    if selector.modifiers.is_empty() {
        match &selector.base {
            Base::All => return Ok(client.tagged_nodes(TAG_ALL)?),
            Base::Tag(tag) => return tagged(client, tag, &tree),
            _ => {}
        }
    }
    let node = resolve_base_one(client, &selector, &tree)?;
    Ok(vec![apply_modifiers(
        client,
        node,
        &selector.modifiers,
        &tree,
    )?])
}

fn tagged(client: &TreeClient, tag: &str, tree: &str) -> Result<Vec<NodeId>> {
    match client.tagged_nodes(tag) {
        Ok(nodes) => Ok(nodes),
        Err(TreeError::NotFound(_)) => Err(SelectError::unresolved(tag, tree)),
        Err(e) => Err(e.into()),
    }
}

fn resolve_base_one(client: &TreeClient, selector: &Selector, tree: &str) -> Result<NodeId> {
    match &selector.base {
        Base::Id(raw) => {
            let node = NodeId(*raw);
            if client.exists(node) {
                Ok(node)
            } else {
                Err(SelectError::unresolved(raw.to_string(), tree))
            }
        }
        Base::Root => Ok(client.root()?),
        Base::All => {
            let nodes = client.tagged_nodes(TAG_ALL)?;
            single(nodes, "all", tree)
        }
        Base::Tag(tag) => {
            let nodes = tagged(client, tag, tree)?;
            single(nodes, tag, tree)
        }
    }
}

fn single(nodes: Vec<NodeId>, token: &str, tree: &str) -> Result<NodeId> {
    match nodes.len() {
        0 => Err(SelectError::unresolved(token, tree)),
        1 => Ok(nodes[0]),
        count => Err(SelectError::Ambiguous {
            token: token.to_string(),
            count,
            tree: tree.to_string(),
        }),
    }
}

fn apply_modifiers(
    client: &TreeClient,
    start: NodeId,
    modifiers: &[Modifier],
    tree: &str,
) -> Result<NodeId> {
    let mut node = start;
    for modifier in modifiers {
        node = match modifier {
            Modifier::Parent => step(client.parent(node)?, "parent", tree)?,
            Modifier::FirstChild => step(client.first_child(node)?, "firstchild", tree)?,
            Modifier::LastChild => step(client.last_child(node)?, "lastchild", tree)?,
            Modifier::Next => step(client.next_in_order(node)?, "next", tree)?,
            Modifier::NextSibling => step(client.next_sibling(node)?, "nextsibling", tree)?,
            Modifier::Previous => step(client.prev_in_order(node)?, "previous", tree)?,
            Modifier::PrevSibling => step(client.prev_sibling(node)?, "prevsibling", tree)?,
            Modifier::Label(label) => {
                step(client.find_child(node, label)?, label.as_str(), tree)?
            }
            Modifier::Id(raw) => {
                let target = NodeId(*raw);
                if client.exists(target) {
                    target
                } else {
                    return Err(SelectError::unresolved(raw.to_string(), tree));
                }
            }
        };
    }
    Ok(node)
}

fn step(next: Option<NodeId>, token: &str, tree: &str) -> Result<NodeId> {
    next.ok_or_else(|| SelectError::unresolved(token, tree))
}
