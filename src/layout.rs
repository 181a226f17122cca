//! On-disk experiment layout and per-step completion artifacts

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const COMPLETE_MARKER: &str = ".complete";

/// The seven ordered steps of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    PrepareExamples,
    SamplePrompts,
    SampleSessions,
    SelectNodes,
    ParentSessions,
    LeafSessions,
    ExtractExamples,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::PrepareExamples,
        Step::SamplePrompts,
        Step::SampleSessions,
        Step::SelectNodes,
        Step::ParentSessions,
        Step::LeafSessions,
        Step::ExtractExamples,
    ];

    /// 1-based position within the iteration
    pub fn number(self) -> usize {
        self as usize + 1
    }

    /// The following step, `None` after the last
    pub fn next(self) -> Option<Step> {
        Step::ALL.get(self.number()).copied()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::PrepareExamples => "prepare-examples",
            Step::SamplePrompts => "sample-prompts",
            Step::SampleSessions => "sample-sessions",
            Step::SelectNodes => "select-nodes",
            Step::ParentSessions => "parent-sessions",
            Step::LeafSessions => "leaf-sessions",
            Step::ExtractExamples => "extract-examples",
        };
        write!(f, "{} ({name})", self.number())
    }
}

/// Root directory of one experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new(base_dir: impl AsRef<Path>, experiment_id: &str) -> Self {
        Self {
            root: base_dir.as_ref().join(experiment_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn used_prompts_path(&self) -> PathBuf {
        self.root.join("used_prompts.json")
    }

    pub fn skipped_prompts_path(&self) -> PathBuf {
        self.root.join("skipped_prompts.json")
    }

    pub fn iteration(&self, index: usize) -> IterationLayout {
        IterationLayout {
            index,
            root: self.root.join(format!("iteration_{index}")),
        }
    }

    /// Indices of existing iteration directories, ascending
    pub fn iteration_indices(&self) -> io::Result<Vec<usize>> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("iteration_"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }
}

/// Directory of one iteration and the artifacts each step leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationLayout {
    index: usize,
    root: PathBuf,
}

impl IterationLayout {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn examples_dir(&self) -> PathBuf {
        self.root.join("examples")
    }

    /// Input leaf examples for this iteration
    pub fn leaf_examples(&self) -> PathBuf {
        self.examples_dir().join("leaf_examples.json")
    }

    /// Input parent examples for this iteration
    pub fn parent_examples(&self) -> PathBuf {
        self.examples_dir().join("parent_examples.json")
    }

    pub fn sampled_prompts(&self) -> PathBuf {
        self.root.join("sampled_prompts.json")
    }

    pub fn sample_sessions_dir(&self) -> PathBuf {
        self.root.join("sample-sessions")
    }

    pub fn selected_nodes(&self) -> PathBuf {
        self.root.join("selected_nodes.json")
    }

    pub fn parent_sessions_dir(&self) -> PathBuf {
        self.root.join("parent-sessions")
    }

    /// Prompts the parent author skipped in this iteration
    pub fn skipped(&self) -> PathBuf {
        self.parent_sessions_dir().join("skipped.json")
    }

    pub fn leaf_sessions_dir(&self) -> PathBuf {
        self.root.join("leaf-sessions")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Leaf pool produced by this iteration
    pub fn output_leaf_examples(&self) -> PathBuf {
        self.output_dir().join("leaf_examples.json")
    }

    /// Parent pool produced by this iteration
    pub fn output_parent_examples(&self) -> PathBuf {
        self.output_dir().join("parent_examples.json")
    }

    /// `{prompt_index:05}.json`
    pub fn sample_session(&self, prompt_index: usize) -> PathBuf {
        self.sample_sessions_dir().join(format!("{prompt_index:05}.json"))
    }

    /// `{slot:03}-{prompt_index:05}.json`
    pub fn parent_session(&self, slot: usize, prompt_index: usize) -> PathBuf {
        self.parent_sessions_dir().join(format!("{slot:03}-{prompt_index:05}.json"))
    }

    /// `{slot:03}-{prompt_index:05}.json`
    pub fn leaf_session(&self, slot: usize, prompt_index: usize) -> PathBuf {
        self.leaf_sessions_dir().join(format!("{slot:03}-{prompt_index:05}.json"))
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [
            self.examples_dir(),
            self.sample_sessions_dir(),
            self.parent_sessions_dir(),
            self.leaf_sessions_dir(),
            self.output_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn marker(&self, step: Step) -> Option<PathBuf> {
        match step {
            Step::SampleSessions => Some(self.sample_sessions_dir().join(COMPLETE_MARKER)),
            Step::ParentSessions => Some(self.parent_sessions_dir().join(COMPLETE_MARKER)),
            Step::LeafSessions => Some(self.leaf_sessions_dir().join(COMPLETE_MARKER)),
            _ => None,
        }
    }

    /// Artifacts whose joint existence marks `step` complete
    pub fn artifacts(&self, step: Step) -> Vec<PathBuf> {
        match step {
            Step::PrepareExamples => vec![self.leaf_examples(), self.parent_examples()],
            Step::SamplePrompts => vec![self.sampled_prompts()],
            Step::SelectNodes => vec![self.selected_nodes()],
            Step::ExtractExamples => vec![self.output_leaf_examples(), self.output_parent_examples()],
            Step::SampleSessions | Step::ParentSessions | Step::LeafSessions => {
                self.marker(step).into_iter().collect()
            }
        }
    }

    pub fn is_step_complete(&self, step: Step) -> bool {
        self.artifacts(step).iter().all(|p| p.exists())
    }

    /// First step without its artifacts, `None` when the iteration is done
    pub fn first_missing_step(&self) -> Option<Step> {
        Step::ALL.into_iter().find(|step| !self.is_step_complete(*step))
    }

    /// Write the completion marker of a directory step. Other steps are
    /// complete once their documents are written.
    pub fn mark_complete(&self, step: Step) -> io::Result<()> {
        match self.marker(step) {
            Some(marker) => fs::write(marker, b""),
            None => Ok(()),
        }
    }

    /// Session documents in a step directory, sorted by name
    pub fn list_session_files(dir: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_session = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != "skipped.json");
            if is_session {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
