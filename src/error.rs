//! Conclave error types

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::layout::Step;

/// Errors reported by a generation backend
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network failure, rate limit or similar; worth retrying
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// The call did not finish within the configured timeout
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the request outright
    #[error("Fatal backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether the retry policy should try again
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }
}

/// Placeholder resolution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// `$RESPONSE{k}` with `k` beyond the responses recorded so far
    #[error("Unresolved placeholder {token}: {available} response(s) recorded")]
    UnresolvedPlaceholder { token: String, available: usize },

    /// Leaf output may not reference anything
    #[error("Leaf output contains placeholder {token}")]
    PlaceholderInLeaf { token: String },
}

/// Malformed event script from a backend or author
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("No events found in script")]
    Empty,

    #[error("Mismatched tags: <{open}> closed by </{close}>")]
    MismatchedTag { open: String, close: String },

    #[error("Unexpected <{0}> segment in generated script")]
    UnexpectedTag(String),
}

/// Failure while generating one tree. Every variant is fatal for the tree
/// under construction and only for that tree.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Retry policy exhausted, or the backend failed fatally
    #[error("Backend failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Malformed event script: {0}")]
    Script(#[from] ScriptError),

    #[error("Invalid session: {0}")]
    Validation(String),

    /// Character budget overflowed before any response could be submitted
    #[error("Session character budget exceeded before any response was recorded")]
    BudgetExhausted,

    /// Interactive collaborator went away
    #[error("Authoring collaborator unavailable: {0}")]
    Authoring(String),
}

/// Errors loading or saving documents
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid document structure: {0}")]
    Structure(String),
}

impl DocumentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DocumentError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Prompt sampling errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplerError {
    #[error("Prompt pool exhausted: requested {requested}, {available} available")]
    PromptPoolExhausted { requested: usize, available: usize },

    #[error("Prompt index {0} is outside the prompt pool")]
    UnknownIndex(usize),
}

/// Errors that stop an experiment
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Malformed identifier or parameter
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory exists and resume was not requested
    #[error("Experiment already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Too many per-prompt failures for the next step to proceed
    #[error("Step {step} produced {produced} of {required} required outputs")]
    InsufficientOutput {
        step: Step,
        required: usize,
        produced: usize,
    },
}

impl ExperimentError {
    /// Whether the prompt pool ran dry
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            ExperimentError::Sampler(SamplerError::PromptPoolExhausted { .. })
        )
    }
}
