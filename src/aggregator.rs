//! Example pools built from generated trees

use tracing::{debug, info};

use crate::config::ExperimentConfig;
use crate::document::{ExampleDocument, ExampleSession};
use crate::hierarchy::SessionTree;

/// Maintains the parent pool (accumulated up to a cap) and the leaf pool
/// (replaced every iteration)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExampleAggregator {
    leaf_count: usize,
    parent_cap: usize,
}

impl ExampleAggregator {
    pub fn new(leaf_count: usize, parent_cap: usize) -> Self {
        Self { leaf_count, parent_cap }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.leaf_examples_per_iteration, config.max_parent_examples)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn parent_cap(&self) -> usize {
        self.parent_cap
    }

    /// Whether `pool` has stopped accepting parent examples
    pub fn is_frozen(&self, pool: &ExampleDocument) -> bool {
        pool.len() >= self.parent_cap
    }

    /// Parent pool the first accumulation starts from: the seed examples
    /// when kept, otherwise empty
    pub fn initial_parent_pool(&self, seed: &ExampleDocument, keep_seed: bool) -> ExampleDocument {
        if !keep_seed {
            return ExampleDocument::default();
        }
        ExampleDocument::new(seed.sessions.iter().take(self.parent_cap).cloned().collect())
    }

    /// Append the root of each parent-session tree, in order, while the pool
    /// is below its cap. A pool at its cap is returned unchanged.
    pub fn accumulate_parents(&self, mut pool: ExampleDocument, trees: &[SessionTree]) -> ExampleDocument {
        let before = pool.len();
        for tree in trees {
            if self.is_frozen(&pool) {
                break;
            }
            pool.sessions.push(ExampleSession::parent(tree.root()));
        }

        if pool.len() > before {
            info!(added = pool.len() - before, total = pool.len(), "Accumulated parent examples");
        } else {
            debug!(total = pool.len(), "Parent pool unchanged");
        }
        pool
    }

    /// Build the next leaf pool from exactly `leaf_count` leaf-session trees.
    ///
    /// Returns the number of available trees when there are too few.
    pub fn replace_leaves(&self, trees: &[SessionTree]) -> Result<ExampleDocument, usize> {
        if trees.len() < self.leaf_count {
            return Err(trees.len());
        }

        let sessions = trees
            .iter()
            .take(self.leaf_count)
            .map(|tree| ExampleSession::leaf(tree.root().prompt.clone(), tree.final_response()))
            .collect();
        Ok(ExampleDocument::new(sessions))
    }
}
