//! Prompt pool and cross-iteration used-prompts tracking

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::document::{read_json, write_json_atomic};
use crate::error::{DocumentError, SamplerError};

/// A sampled prompt with its 1-based index in the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledPrompt {
    pub index: usize,
    pub text: String,
}

/// The full ordered prompt list
#[derive(Debug, Clone, Default)]
pub struct PromptPool {
    prompts: Vec<String>,
}

impl PromptPool {
    /// Load one prompt per line; blank lines are ignored
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DocumentError::io(path, e))?;
        Ok(Self::from_lines(&text))
    }

    pub fn from_lines(text: &str) -> Self {
        let prompts = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Self { prompts }
    }

    /// Prompt at a 1-based index
    pub fn get(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.prompts.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// All 1-based indices
    pub fn indices(&self) -> impl Iterator<Item = usize> {
        1..=self.prompts.len()
    }
}

/// Cumulative set of consumed prompt indices.
///
/// Skipped prompts are a subset of used ones, tracked separately so they can
/// be told apart from prompts that produced examples.
#[derive(Debug, Clone)]
pub struct UsedPrompts {
    path: PathBuf,
    skipped_path: PathBuf,
    used: BTreeSet<usize>,
    skipped: BTreeSet<usize>,
}

impl UsedPrompts {
    /// Empty tracker persisting to the given paths
    pub fn new(path: impl Into<PathBuf>, skipped_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            skipped_path: skipped_path.into(),
            used: BTreeSet::new(),
            skipped: BTreeSet::new(),
        }
    }

    /// Load both records, starting empty when a file does not exist yet
    pub fn load_or_default(path: impl Into<PathBuf>, skipped_path: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let path = path.into();
        let skipped_path = skipped_path.into();

        let used: Vec<usize> = if path.exists() { read_json(&path)? } else { Vec::new() };
        let skipped: Vec<usize> = if skipped_path.exists() {
            read_json(&skipped_path)?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            skipped_path,
            used: used.into_iter().collect(),
            skipped: skipped.into_iter().collect(),
        })
    }

    pub fn contains(&self, index: usize) -> bool {
        self.used.contains(&index)
    }

    pub fn is_skipped(&self, index: usize) -> bool {
        self.skipped.contains(&index)
    }

    /// Record indices as used; returns how many were new
    pub fn mark_used(&mut self, indices: impl IntoIterator<Item = usize>) -> usize {
        indices.into_iter().filter(|i| self.used.insert(*i)).count()
    }

    /// Mark an index unusable
    pub fn skip(&mut self, index: usize) {
        self.used.insert(index);
        self.skipped.insert(index);
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Used indices in ascending order
    pub fn indices(&self) -> Vec<usize> {
        self.used.iter().copied().collect()
    }

    pub fn skipped(&self) -> Vec<usize> {
        self.skipped.iter().copied().collect()
    }

    /// Atomically write both records
    pub fn persist(&self) -> Result<(), DocumentError> {
        write_json_atomic(&self.path, &self.indices())?;
        write_json_atomic(&self.skipped_path, &self.skipped())?;
        debug!(used = self.used.len(), skipped = self.skipped.len(), "Persisted used prompts");
        Ok(())
    }
}

/// Samples prompts without replacement across iterations
#[derive(Debug, Clone)]
pub struct PromptSampler {
    pool: PromptPool,
}

impl PromptSampler {
    pub fn new(pool: PromptPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PromptPool {
        &self.pool
    }

    /// Unused prompts remaining
    pub fn available(&self, used: &UsedPrompts) -> usize {
        self.pool.indices().filter(|i| !used.contains(*i)).count()
    }

    /// Draw `n` distinct unused prompts uniformly at random and mark them
    /// used. Nothing is marked when the pool cannot satisfy the request.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        used: &mut UsedPrompts,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<SampledPrompt>, SamplerError> {
        let available: Vec<usize> = self.pool.indices().filter(|i| !used.contains(*i)).collect();
        if available.len() < n {
            return Err(SamplerError::PromptPoolExhausted {
                requested: n,
                available: available.len(),
            });
        }

        let sampled: Vec<SampledPrompt> = available
            .choose_multiple(rng, n)
            .filter_map(|&index| {
                self.pool.get(index).map(|text| SampledPrompt {
                    index,
                    text: text.to_string(),
                })
            })
            .collect();

        used.mark_used(sampled.iter().map(|p| p.index));
        info!(
            sampled = sampled.len(),
            remaining = available.len() - sampled.len(),
            "Sampled prompts"
        );
        Ok(sampled)
    }

    /// Remove an index from future availability without producing an example
    pub fn skip(&self, used: &mut UsedPrompts, index: usize) -> Result<(), SamplerError> {
        if self.pool.get(index).is_none() {
            return Err(SamplerError::UnknownIndex(index));
        }
        used.skip(index);
        debug!(prompt_index = index, "Skipped prompt");
        Ok(())
    }
}
