//! Delegation tree as an arena of sessions indexed by pre-order id

use crate::error::DocumentError;
use crate::session::{Event, Session};

/// A complete delegation tree.
///
/// Nodes live in a flat arena; a node's index is its pre-order id, so the
/// root is always `nodes[0]` and every subtree occupies a contiguous range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTree {
    nodes: Vec<Session>,
}

impl SessionTree {
    /// Build a tree from pre-order nodes, checking every structural invariant
    pub fn from_nodes(nodes: Vec<Session>) -> Result<Self, DocumentError> {
        let tree = Self { nodes };
        tree.validate().map_err(DocumentError::Structure)?;
        Ok(tree)
    }

    /// The root session
    pub fn root(&self) -> &Session {
        &self.nodes[0]
    }

    /// Get a node by id
    pub fn get(&self, id: usize) -> Option<&Session> {
        self.nodes.get(id)
    }

    /// All nodes in pre-order
    pub fn nodes(&self) -> &[Session] {
        &self.nodes
    }

    /// Root's resolved output
    pub fn final_response(&self) -> &str {
        self.root().final_response.as_deref().unwrap_or_default()
    }

    /// Get children of a node, in ask order
    pub fn children(&self, id: usize) -> Vec<usize> {
        self.nodes
            .get(id)
            .map(|n| n.child_ids().collect())
            .unwrap_or_default()
    }

    /// Get depth of a node in the tree
    pub fn depth(&self, id: usize) -> Option<usize> {
        self.nodes.get(id).map(|n| n.depth)
    }

    /// Deepest node's depth
    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Get total node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a validated tree
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn walk(&self, id: usize, depth: usize, order: &mut Vec<usize>) -> Result<(), String> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| format!("response names missing session {id}"))?;
        if node.depth != depth {
            return Err(format!("session {id} at depth {depth} records depth {}", node.depth));
        }
        order.push(id);

        for child_id in node.child_ids() {
            let expected = order.len();
            if child_id != expected {
                return Err(format!(
                    "session {child_id} appears where pre-order id {expected} is expected"
                ));
            }
            self.walk(child_id, depth + 1, order)?;

            let child_final = self.nodes[child_id].final_response.as_deref();
            let recorded = node.events.iter().find_map(|e| match e {
                Event::Response { child_id: c, text } if *c == child_id => {
                    Some(text.as_str())
                }
                _ => None,
            });
            if child_final != recorded {
                return Err(format!(
                    "response recorded at session {id} differs from session {child_id}'s final response"
                ));
            }
        }
        Ok(())
    }

    /// Ids are exactly `0..N` in pre-order, depths match distances from the
    /// root, responses match child outputs and every node is complete.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no root".into());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if node.id != index {
                return Err(format!("session at position {index} has id {}", node.id));
            }
            node.validate()?;
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        self.walk(0, 0, &mut order)?;
        if order.len() != self.nodes.len() {
            return Err(format!(
                "{} session(s) unreachable from the root",
                self.nodes.len() - order.len()
            ));
        }
        Ok(())
    }
}
