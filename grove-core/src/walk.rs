//! Tree traversal
//!
//! Depth-first (pre-, post-, and in-order) and breadth-first walks over a
//! subtree. Sibling links are re-read between callback invocations, so a
//! callback may mutate the tree mid-walk: a deleted node simply ends its
//! branch, a created sibling is picked up if it lands ahead of the cursor.

use crate::client::TreeClient;
use crate::error::Result;
use crate::node::NodeId;
use std::collections::VecDeque;

/// Visit order for [`TreeClient::walk`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOrder {
    /// Parent before children
    Pre,
    /// Children before parent (the classic `apply` order)
    Post,
    /// First child's subtree, then the parent, then the remaining children
    Inorder,
    /// Level by level, via an explicit queue
    Breadth,
}

/// Callback verdict for each visited node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking
    Continue,
    /// Skip this node's subtree (meaningful for pre-order and
    /// breadth-first; a no-op once the children were already visited)
    Prune,
    /// End the whole walk successfully
    Stop,
}

/// Internal flow state threaded through the recursion
enum Flow {
    Continue,
    Stop,
}

impl TreeClient {
    /// Walk the subtree rooted at `start`, invoking `f` per node in the
    /// given order. `Err` from the callback aborts the walk and
    /// propagates.
    pub fn walk<F>(&self, start: NodeId, order: WalkOrder, mut f: F) -> Result<()>
    where
        F: FnMut(NodeId) -> Result<WalkControl>,
    {
        match order {
            WalkOrder::Breadth => self.walk_breadth(start, &mut f),
            _ => self.walk_depth(start, order, &mut f).map(|_| ()),
        }
    }

    /// Postorder walk of the whole tree (the default `apply`)
    pub fn apply<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(NodeId) -> Result<WalkControl>,
    {
        self.walk(self.root()?, WalkOrder::Post, f)
    }

    fn walk_depth<F>(&self, node: NodeId, order: WalkOrder, f: &mut F) -> Result<Flow>
    where
        F: FnMut(NodeId) -> Result<WalkControl>,
    {
        if !self.exists(node) {
            // A callback higher up deleted this branch
            return Ok(Flow::Continue);
        }
        let mut visited_self = false;
        if order == WalkOrder::Pre {
            match f(node)? {
                WalkControl::Continue => {}
                WalkControl::Prune => return Ok(Flow::Continue),
                WalkControl::Stop => return Ok(Flow::Stop),
            }
            visited_self = true;
        }
        let mut first = true;
        let mut child = match self.exists(node) {
            true => self.first_child(node)?,
            false => None,
        };
        while let Some(c) = child {
            // Fetch the successor before visiting: the callback may
            // delete or move the child out from under us.
            let next = self.next_sibling(c).unwrap_or(None);
            if let Flow::Stop = self.walk_depth(c, order, f)? {
                return Ok(Flow::Stop);
            }
            if order == WalkOrder::Inorder && first && !visited_self {
                match f(node)? {
                    WalkControl::Continue | WalkControl::Prune => {}
                    WalkControl::Stop => return Ok(Flow::Stop),
                }
                visited_self = true;
            }
            first = false;
            child = next;
        }
        if !visited_self {
            match f(node)? {
                WalkControl::Continue | WalkControl::Prune => {}
                WalkControl::Stop => return Ok(Flow::Stop),
            }
        }
        Ok(Flow::Continue)
    }

    fn walk_breadth<F>(&self, start: NodeId, f: &mut F) -> Result<()>
    where
        F: FnMut(NodeId) -> Result<WalkControl>,
    {
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            if !self.exists(node) {
                continue;
            }
            match f(node)? {
                WalkControl::Continue => {}
                WalkControl::Prune => continue,
                WalkControl::Stop => return Ok(()),
            }
            if self.exists(node) {
                queue.extend(self.children(node)?);
            }
        }
        Ok(())
    }
}
