//! Experiment state machine - sequences iterations of seven checkpointed steps

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregator::ExampleAggregator;
use crate::backend::Backend;
use crate::config::ExperimentConfig;
use crate::document::{self, ExampleDocument, ExamplePools};
use crate::error::ExperimentError;
use crate::generator::{Authored, SessionSource, TreeGenerator};
use crate::hierarchy::SessionTree;
use crate::layout::{ExperimentLayout, IterationLayout, Step};
use crate::sampler::{PromptPool, PromptSampler, SampledPrompt, UsedPrompts};
use crate::selector::{self, NodeSelection};

/// Where the experiment stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentState {
    Init,
    RunningIteration { iteration: usize, step: Step },
    Done,
    Failed(String),
}

/// Final example pools of a finished experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub iterations: usize,
    pub leaf_examples_path: PathBuf,
    pub leaf_examples: usize,
    pub parent_examples_path: PathBuf,
    pub parent_examples: usize,
    pub prompts_used: usize,
    pub prompts_skipped: usize,
}

/// A tree to generate unless its document already exists
struct GenerationJob {
    prompt_index: usize,
    prompt: String,
    path: PathBuf,
}

/// A resumable data-collection experiment.
///
/// Every step leaves its artifacts on disk; the process may stop at any
/// point and a resumed experiment continues from the first step whose
/// artifacts are missing.
pub struct Experiment {
    config: ExperimentConfig,
    layout: ExperimentLayout,
    backend: Arc<dyn Backend>,
    generator: TreeGenerator,
    parent_source: Option<Arc<dyn SessionSource>>,
    sampler: PromptSampler,
    used: UsedPrompts,
    resume: bool,
    /// Set once this instance has created or adopted the directory
    attached: bool,
    state: ExperimentState,
}

impl Experiment {
    /// Create an experiment under `base_dir/<experiment_id>`. Nothing touches
    /// the disk until the first [`advance`](Self::advance).
    pub fn new(
        config: ExperimentConfig,
        base_dir: impl AsRef<Path>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, ExperimentError> {
        config.validate()?;
        let layout = ExperimentLayout::new(base_dir, &config.experiment_id);
        let used = UsedPrompts::new(layout.used_prompts_path(), layout.skipped_prompts_path());

        Ok(Self {
            generator: build_generator(&config, &backend),
            config,
            layout,
            backend,
            parent_source: None,
            sampler: PromptSampler::new(PromptPool::default()),
            used,
            resume: false,
            attached: false,
            state: ExperimentState::Init,
        })
    }

    /// Continue an existing experiment instead of failing (builder)
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Author parent sessions with `source` instead of the backend (builder)
    pub fn with_parent_source(mut self, source: Arc<dyn SessionSource>) -> Self {
        self.parent_source = Some(source);
        self
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    /// Active configuration; the persisted one after resuming
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn layout(&self) -> &ExperimentLayout {
        &self.layout
    }

    pub fn used_prompts(&self) -> &UsedPrompts {
        &self.used
    }

    /// Run until done
    #[instrument(skip(self), fields(experiment_id = %self.config.experiment_id))]
    pub async fn run(&mut self) -> Result<ExperimentSummary, ExperimentError> {
        info!(
            resume = self.resume,
            max_iterations = self.config.max_iterations,
            "Starting experiment"
        );

        while self.state != ExperimentState::Done {
            self.advance().await?;
        }

        let summary = self.summary()?;
        info!(
            leaf_examples = summary.leaf_examples,
            parent_examples = summary.parent_examples,
            prompts_used = summary.prompts_used,
            "Experiment complete"
        );
        Ok(summary)
    }

    /// Perform one state transition.
    ///
    /// On error the state becomes `Failed` and the error is returned; the
    /// next call re-derives the state from disk. An experiment this
    /// instance never created or adopted still needs `with_resume`.
    pub async fn advance(&mut self) -> Result<(), ExperimentError> {
        let result = match self.state.clone() {
            ExperimentState::Init => self.init(),
            ExperimentState::RunningIteration { iteration, step } => self
                .run_step(iteration, step)
                .await
                .map(|()| self.next_state(iteration, step)),
            ExperimentState::Done => return Ok(()),
            ExperimentState::Failed(reason) => {
                info!(%reason, attached = self.attached, "Recovering failed experiment from disk");
                self.state = ExperimentState::Init;
                return Ok(());
            }
        };

        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, state = ?self.state, "Experiment failed");
                self.state = ExperimentState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn init(&mut self) -> Result<ExperimentState, ExperimentError> {
        let exists = self.layout.exists();
        if exists && !self.resume && !self.attached {
            return Err(ExperimentError::AlreadyExists(self.layout.root().to_path_buf()));
        }

        let persisted = exists && self.layout.config_path().exists();
        if persisted {
            let config: ExperimentConfig = document::read_json(self.layout.config_path())?;
            config.validate()?;
            if config != self.config {
                info!("Using persisted configuration");
            }
            self.generator = build_generator(&config, &self.backend);
            self.config = config;
        }

        self.sampler = PromptSampler::new(PromptPool::load(&self.config.writing_prompts_path)?);
        if self.sampler.pool().is_empty() {
            return Err(ExperimentError::Config(format!(
                "no prompts in {}",
                self.config.writing_prompts_path.display()
            )));
        }

        if !persisted {
            ExampleDocument::load(&self.config.seed_leaf_examples)?;
            ExampleDocument::load(&self.config.seed_parent_examples)?;
            self.layout.create()?;
            self.attached = true;
            document::write_json_atomic(self.layout.config_path(), &self.config)?;
            info!(root = %self.layout.root().display(), "Created experiment");
        }
        self.attached = true;

        self.used = UsedPrompts::load_or_default(
            self.layout.used_prompts_path(),
            self.layout.skipped_prompts_path(),
        )?;
        self.resume_point()
    }

    /// First incomplete step of the highest iteration on disk
    fn resume_point(&mut self) -> Result<ExperimentState, ExperimentError> {
        let indices = self.layout.iteration_indices()?;
        let Some(&latest) = indices.last() else {
            return Ok(ExperimentState::RunningIteration {
                iteration: 0,
                step: Step::PrepareExamples,
            });
        };

        let iteration = self.layout.iteration(latest);
        match iteration.first_missing_step() {
            Some(step) => {
                self.reconcile_sampled(&iteration)?;
                info!(iteration = latest, step = %step, used = self.used.len(), "Resuming experiment");
                Ok(ExperimentState::RunningIteration {
                    iteration: latest,
                    step,
                })
            }
            None => Ok(self.next_state(latest, Step::ExtractExamples)),
        }
    }

    /// Sampled prompts are written before the used-prompts record; repair
    /// the record if the process stopped in between.
    fn reconcile_sampled(&mut self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        if !iteration.sampled_prompts().exists() {
            return Ok(());
        }
        let sampled: Vec<SampledPrompt> = document::read_json(iteration.sampled_prompts())?;
        let added = self.used.mark_used(sampled.iter().map(|p| p.index));
        if added > 0 {
            warn!(iteration = iteration.index(), added, "Used prompts record was behind, repaired");
            self.used.persist()?;
        }
        Ok(())
    }

    fn next_state(&self, iteration: usize, step: Step) -> ExperimentState {
        match step.next() {
            Some(step) => ExperimentState::RunningIteration { iteration, step },
            None if iteration + 1 < self.config.max_iterations => {
                info!(iteration, "Iteration complete");
                ExperimentState::RunningIteration {
                    iteration: iteration + 1,
                    step: Step::PrepareExamples,
                }
            }
            None => ExperimentState::Done,
        }
    }

    /// RNG for one step; reproducible when a seed is configured
    fn rng(&self, iteration: usize, step: Step) -> StdRng {
        match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(((iteration as u64) << 4) | step.number() as u64)),
            None => StdRng::from_entropy(),
        }
    }

    fn aggregator(&self) -> ExampleAggregator {
        ExampleAggregator::from_config(&self.config)
    }

    fn parent_source(&self) -> Arc<dyn SessionSource> {
        match &self.parent_source {
            Some(source) => Arc::clone(source),
            None => Arc::new(self.generator.clone()),
        }
    }

    async fn run_step(&mut self, index: usize, step: Step) -> Result<(), ExperimentError> {
        let iteration = self.layout.iteration(index);
        iteration.create_dirs()?;
        if step == Step::PrepareExamples {
            info!(iteration = index, "Starting iteration");
        }
        debug!(iteration = index, step = %step, "Running step");

        match step {
            Step::PrepareExamples => self.prepare_examples(&iteration),
            Step::SamplePrompts => self.sample_prompts(&iteration),
            Step::SampleSessions => self.sample_sessions(&iteration).await,
            Step::SelectNodes => self.select_nodes(&iteration),
            Step::ParentSessions => self.parent_sessions(&iteration).await,
            Step::LeafSessions => self.leaf_sessions(&iteration).await,
            Step::ExtractExamples => self.extract_examples(&iteration),
        }
    }

    // === Steps ===

    /// Seed copies for the first iteration, previous outputs afterwards
    fn prepare_examples(&self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let (leaf, parent) = match iteration.index() {
            0 => (
                ExampleDocument::load(&self.config.seed_leaf_examples)?,
                ExampleDocument::load(&self.config.seed_parent_examples)?,
            ),
            n => {
                let previous = self.layout.iteration(n - 1);
                (
                    ExampleDocument::load(previous.output_leaf_examples())?,
                    ExampleDocument::load(previous.output_parent_examples())?,
                )
            }
        };

        parent.save(iteration.parent_examples())?;
        leaf.save(iteration.leaf_examples())?;
        info!(
            iteration = iteration.index(),
            leaf_examples = leaf.len(),
            parent_examples = parent.len(),
            "Prepared example pools"
        );
        Ok(())
    }

    fn sample_prompts(&mut self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let mut rng = self.rng(iteration.index(), Step::SamplePrompts);
        let count = self.config.prompts_per_iteration();
        let prompts = self.sampler.sample(&mut self.used, count, &mut rng)?;

        document::write_json_atomic(iteration.sampled_prompts(), &prompts)?;
        self.used.persist()?;
        info!(iteration = iteration.index(), sampled = prompts.len(), used = self.used.len(), "Sampled prompts");
        Ok(())
    }

    async fn sample_sessions(&self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let prompts: Vec<SampledPrompt> = document::read_json(iteration.sampled_prompts())?;
        let pools = load_pools(iteration)?;
        let jobs = prompts
            .into_iter()
            .map(|p| GenerationJob {
                path: iteration.sample_session(p.index),
                prompt_index: p.index,
                prompt: p.text,
            })
            .collect();

        let produced = self
            .generate_missing(jobs, self.config.sample_max_depth, &pools)
            .await?;
        finish_step(
            iteration,
            Step::SampleSessions,
            self.config.leaf_examples_per_iteration,
            produced,
        )
    }

    fn select_nodes(&self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let trees = load_trees(&iteration.sample_sessions_dir())?;
        let mut rng = self.rng(iteration.index(), Step::SelectNodes);

        let selection = NodeSelection {
            parent: selector::select_nodes(&trees, self.config.parent_examples_per_iteration, &mut rng),
            leaf: selector::select_nodes(&trees, self.config.leaf_examples_per_iteration, &mut rng),
        };
        if selection.leaf.len() < self.config.leaf_examples_per_iteration {
            return Err(ExperimentError::InsufficientOutput {
                step: Step::SelectNodes,
                required: self.config.leaf_examples_per_iteration,
                produced: selection.leaf.len(),
            });
        }

        document::write_json_atomic(iteration.selected_nodes(), &selection)?;
        info!(
            iteration = iteration.index(),
            trees = trees.len(),
            parent = selection.parent.len(),
            leaf = selection.leaf.len(),
            "Selected nodes"
        );
        Ok(())
    }

    async fn parent_sessions(&mut self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let mut skipped: Vec<usize> = if iteration.skipped().exists() {
            document::read_json(iteration.skipped())?
        } else {
            Vec::new()
        };

        let pool = self.accumulated_parent_pool(iteration)?;
        if self.config.parent_examples_per_iteration == 0 || self.aggregator().is_frozen(&pool) {
            info!(
                iteration = iteration.index(),
                parent_examples = pool.len(),
                "Parent pool closed, skipping parent sessions"
            );
            document::write_json_atomic(iteration.skipped(), &skipped)?;
            return finish_step(iteration, Step::ParentSessions, 0, 0);
        }

        let selection: NodeSelection = document::read_json(iteration.selected_nodes())?;
        let pools = load_pools(iteration)?;
        let source = self.parent_source();
        let mut produced = 0;

        for (slot, node) in selection.parent.iter().enumerate() {
            let path = iteration.parent_session(slot, node.prompt_index);
            if path.exists() {
                produced += 1;
                continue;
            }
            // A stop between the two skip records leaves only one of them
            let in_iteration = skipped.contains(&node.prompt_index);
            let in_used = self.used.is_skipped(node.prompt_index);
            if in_iteration || in_used {
                if !in_iteration {
                    skipped.push(node.prompt_index);
                }
                if !in_used {
                    self.sampler.skip(&mut self.used, node.prompt_index)?;
                    self.used.persist()?;
                }
                continue;
            }

            match source
                .build_session(&node.prompt, self.config.parent_max_depth, &pools)
                .await
            {
                Ok(Authored::Session(tree)) => {
                    document::save_tree(&path, &tree)?;
                    produced += 1;
                    debug!(prompt_index = node.prompt_index, nodes = tree.len(), "Saved parent session");
                }
                Ok(Authored::Skipped) => {
                    skipped.push(node.prompt_index);
                    document::write_json_atomic(iteration.skipped(), &skipped)?;
                    self.sampler.skip(&mut self.used, node.prompt_index)?;
                    self.used.persist()?;
                    info!(prompt_index = node.prompt_index, "Prompt skipped by parent author");
                }
                Err(e) => {
                    warn!(prompt_index = node.prompt_index, error = %e, "Parent session failed, prompt discarded");
                }
            }
        }

        document::write_json_atomic(iteration.skipped(), &skipped)?;
        finish_step(iteration, Step::ParentSessions, 0, produced)
    }

    async fn leaf_sessions(&self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let selection: NodeSelection = document::read_json(iteration.selected_nodes())?;
        let pools = load_pools(iteration)?;
        let jobs = selection
            .leaf
            .into_iter()
            .enumerate()
            .map(|(slot, node)| GenerationJob {
                path: iteration.leaf_session(slot, node.prompt_index),
                prompt_index: node.prompt_index,
                prompt: node.prompt,
            })
            .collect();

        let produced = self
            .generate_missing(jobs, self.config.leaf_max_depth, &pools)
            .await?;
        finish_step(
            iteration,
            Step::LeafSessions,
            self.config.leaf_examples_per_iteration,
            produced,
        )
    }

    fn extract_examples(&self, iteration: &IterationLayout) -> Result<(), ExperimentError> {
        let aggregator = self.aggregator();

        let leaf_trees = trees_only(load_trees(&iteration.leaf_sessions_dir())?);
        let leaf = aggregator
            .replace_leaves(&leaf_trees)
            .map_err(|produced| ExperimentError::InsufficientOutput {
                step: Step::ExtractExamples,
                required: aggregator.leaf_count(),
                produced,
            })?;

        let parent_trees = trees_only(load_trees(&iteration.parent_sessions_dir())?);
        let parent = aggregator.accumulate_parents(self.accumulated_parent_pool(iteration)?, &parent_trees);

        parent.save(iteration.output_parent_examples())?;
        leaf.save(iteration.output_leaf_examples())?;
        info!(
            iteration = iteration.index(),
            leaf_examples = leaf.len(),
            parent_examples = parent.len(),
            "Extracted examples"
        );
        Ok(())
    }

    // === Helpers ===

    /// Parent pool that this iteration's parent sessions accumulate onto
    fn accumulated_parent_pool(&self, iteration: &IterationLayout) -> Result<ExampleDocument, ExperimentError> {
        let input = ExampleDocument::load(iteration.parent_examples())?;
        Ok(match iteration.index() {
            0 => self
                .aggregator()
                .initial_parent_pool(&input, self.config.keep_seed_parent_examples),
            _ => input,
        })
    }

    /// Generate every job whose document does not exist yet, at most
    /// `max_concurrent_sessions` at a time. Returns how many documents exist
    /// afterwards.
    async fn generate_missing(
        &self,
        jobs: Vec<GenerationJob>,
        depth_budget: usize,
        pools: &ExamplePools,
    ) -> Result<usize, ExperimentError> {
        let mut produced = 0;
        let mut handles = Vec::new();
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_sessions));

        for GenerationJob {
            prompt_index,
            prompt,
            path,
        } in jobs
        {
            if path.exists() {
                debug!(prompt_index, path = %path.display(), "Reusing existing session");
                produced += 1;
                continue;
            }

            let generator = self.generator.clone();
            let pools = pools.clone();
            let limit = Arc::clone(&limit);
            let handle = tokio::spawn(async move {
                // Never closed, so acquiring always yields a permit
                let _permit = limit.acquire_owned().await;
                generator.generate_tree(&prompt, depth_budget, &pools).await
            });
            handles.push((prompt_index, path, handle));
        }

        for (prompt_index, path, handle) in handles {
            match handle.await {
                Ok(Ok(tree)) => {
                    document::save_tree(&path, &tree)?;
                    produced += 1;
                    debug!(prompt_index, nodes = tree.len(), "Saved session");
                }
                Ok(Err(e)) => {
                    warn!(prompt_index, error = %e, "Tree generation failed, prompt discarded");
                }
                Err(e) => {
                    warn!(prompt_index, error = %e, "Generation task aborted");
                }
            }
        }
        Ok(produced)
    }

    fn summary(&self) -> Result<ExperimentSummary, ExperimentError> {
        let iterations = self.layout.iteration_indices()?;
        let last = self.layout.iteration(iterations.last().copied().unwrap_or_default());
        let leaf = ExampleDocument::load(last.output_leaf_examples())?;
        let parent = ExampleDocument::load(last.output_parent_examples())?;

        Ok(ExperimentSummary {
            experiment_id: self.config.experiment_id.clone(),
            iterations: iterations.len(),
            leaf_examples_path: last.output_leaf_examples(),
            leaf_examples: leaf.len(),
            parent_examples_path: last.output_parent_examples(),
            parent_examples: parent.len(),
            prompts_used: self.used.len(),
            prompts_skipped: self.used.skipped().len(),
        })
    }
}

fn build_generator(config: &ExperimentConfig, backend: &Arc<dyn Backend>) -> TreeGenerator {
    TreeGenerator::new(Arc::clone(backend), config.sampling_params(), config.retry.clone())
        .with_char_budget(config.session_char_budget)
}

fn load_pools(iteration: &IterationLayout) -> Result<ExamplePools, ExperimentError> {
    Ok(ExamplePools::new(
        ExampleDocument::load(iteration.leaf_examples())?,
        ExampleDocument::load(iteration.parent_examples())?,
    ))
}

fn finish_step(
    iteration: &IterationLayout,
    step: Step,
    required: usize,
    produced: usize,
) -> Result<(), ExperimentError> {
    if produced < required {
        return Err(ExperimentError::InsufficientOutput {
            step,
            required,
            produced,
        });
    }
    iteration.mark_complete(step)?;
    info!(iteration = iteration.index(), step = %step, produced, "Step complete");
    Ok(())
}

/// Prompt index encoded in a session file name
fn prompt_index_of(path: &Path) -> Option<usize> {
    path.file_stem()?.to_str()?.rsplit('-').next()?.parse().ok()
}

/// Load every session document in `dir`, skipping unreadable ones
fn load_trees(dir: &Path) -> Result<Vec<(usize, SessionTree)>, ExperimentError> {
    let mut trees = Vec::new();
    for path in IterationLayout::list_session_files(dir)? {
        let Some(prompt_index) = prompt_index_of(&path) else {
            warn!(path = %path.display(), "Unrecognized session file name, skipping");
            continue;
        };
        match document::load_tree(&path) {
            Ok(tree) => trees.push((prompt_index, tree)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session document"),
        }
    }
    Ok(trees)
}

fn trees_only(trees: Vec<(usize, SessionTree)>) -> Vec<SessionTree> {
    trees.into_iter().map(|(_, tree)| tree).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tests::sample_tree;
    use crate::backend::GenerationRequest;
    use crate::error::BackendError;
    use crate::mock::MockBackend;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &Path) -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "unit".into(),
            leaf_examples_per_iteration: 1,
            parent_examples_per_iteration: 1,
            max_iterations: 2,
            sample_max_depth: 1,
            leaf_max_depth: 0,
            writing_prompts_path: dir.join("prompts.txt"),
            seed_leaf_examples: dir.join("seed_leaf.json"),
            seed_parent_examples: dir.join("seed_parent.json"),
            rng_seed: Some(1),
            ..Default::default()
        }
    }

    fn experiment(dir: &Path) -> Experiment {
        Experiment::new(config(dir), dir.join("runs"), Arc::new(MockBackend::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let bad = ExperimentConfig {
            experiment_id: "no spaces allowed".into(),
            ..config(dir.path())
        };
        let result = Experiment::new(bad, dir.path(), Arc::new(MockBackend::new()));
        assert!(matches!(result, Err(ExperimentError::Config(_))));
    }

    #[test]
    fn test_next_state() {
        let dir = TempDir::new().unwrap();
        let experiment = experiment(dir.path());
        assert_eq!(experiment.state(), &ExperimentState::Init);
        assert_eq!(
            experiment.next_state(0, Step::SelectNodes),
            ExperimentState::RunningIteration {
                iteration: 0,
                step: Step::ParentSessions
            }
        );
        assert_eq!(
            experiment.next_state(0, Step::ExtractExamples),
            ExperimentState::RunningIteration {
                iteration: 1,
                step: Step::PrepareExamples
            }
        );
        assert_eq!(experiment.next_state(1, Step::ExtractExamples), ExperimentState::Done);
    }

    #[test]
    fn test_seeded_rng_is_per_step() {
        use rand::Rng;

        let dir = TempDir::new().unwrap();
        let experiment = experiment(dir.path());
        let a: u64 = experiment.rng(1, Step::SamplePrompts).gen();
        let b: u64 = experiment.rng(1, Step::SamplePrompts).gen();
        let c: u64 = experiment.rng(1, Step::SelectNodes).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_prompt_index_of() {
        assert_eq!(prompt_index_of(Path::new("a/00042.json")), Some(42));
        assert_eq!(prompt_index_of(Path::new("a/003-00017.json")), Some(17));
        assert_eq!(prompt_index_of(Path::new("a/notes.json")), None);
    }

    #[test]
    fn test_load_trees_skips_corrupt_documents() {
        let dir = TempDir::new().unwrap();
        document::save_tree(dir.path().join("00001.json"), &sample_tree()).unwrap();
        fs::write(dir.path().join("00002.json"), "{ not json").unwrap();
        fs::write(dir.path().join("00003.json"), r#"{"id": 5, "prompt": "x"}"#).unwrap();

        let trees = load_trees(dir.path()).unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].0, 1);
    }

    /// Leaf backend that records how many calls overlap
    #[derive(Default)]
    struct OverlapBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Backend for OverlapBackend {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("Answer to: {}", request.prompt))
        }
    }

    #[tokio::test]
    async fn test_generation_respects_concurrency_limit() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(OverlapBackend::default());
        let config = ExperimentConfig {
            max_concurrent_sessions: 2,
            ..config(dir.path())
        };
        let experiment = Experiment::new(config, dir.path().join("runs"), backend.clone()).unwrap();

        let jobs = (1..=6)
            .map(|i| GenerationJob {
                prompt_index: i,
                prompt: format!("prompt {i}"),
                path: dir.path().join(format!("{i:05}.json")),
            })
            .collect();
        let produced = experiment
            .generate_missing(jobs, 0, &ExamplePools::default())
            .await
            .unwrap();

        assert_eq!(produced, 6);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
        assert_eq!(load_trees(dir.path()).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_missing_prompt_file_fails_at_init() {
        let dir = TempDir::new().unwrap();
        let mut experiment = experiment(dir.path());

        let err = experiment.advance().await.unwrap_err();
        assert!(matches!(err, ExperimentError::Document(_)));
        assert!(matches!(experiment.state(), ExperimentState::Failed(_)));
        assert!(!experiment.layout().exists());
    }
}
