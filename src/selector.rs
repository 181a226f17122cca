//! Node selection from generated trees

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::hierarchy::SessionTree;

/// A node picked as the seed prompt for a later generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedNode {
    /// Prompt index of the sample tree the node came from
    pub prompt_index: usize,
    pub node_id: usize,
    /// The node's resolved prompt
    pub prompt: String,
}

/// Nodes chosen in one iteration, persisted as `selected_nodes.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelection {
    pub parent: Vec<SelectedNode>,
    pub leaf: Vec<SelectedNode>,
}

/// Pick one node of `tree` uniformly over its pre-order enumeration
pub fn select_node<R: Rng>(tree: &SessionTree, rng: &mut R) -> usize {
    rng.gen_range(0..tree.len())
}

/// Pick `count` distinct trees without replacement, then one node from each.
///
/// Returns fewer than `count` selections when there are fewer trees.
pub fn select_nodes<R: Rng>(
    trees: &[(usize, SessionTree)],
    count: usize,
    rng: &mut R,
) -> Vec<SelectedNode> {
    trees
        .choose_multiple(rng, count.min(trees.len()))
        .map(|(prompt_index, tree)| {
            let node_id = select_node(tree, rng);
            SelectedNode {
                prompt_index: *prompt_index,
                node_id,
                prompt: tree.nodes()[node_id].prompt.clone(),
            }
        })
        .collect()
}
