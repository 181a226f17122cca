//! Deterministic backend for tests and dry runs.
//!
//! Parent mode asks a fixed number of questions, then submits a combination
//! of every response. Leaf mode echoes the prompt. Failures can be injected
//! per prompt or as a number of leading transient errors.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{Backend, GenerationMode, GenerationRequest};
use crate::error::BackendError;

/// A recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub mode: GenerationMode,
    pub prompt: String,
    pub examples: usize,
}

/// Scripted backend with call recording
pub struct MockBackend {
    asks_per_node: usize,
    fail_on: Vec<String>,
    transient_failures: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockBackend {
    /// Two asks per parent node
    pub fn new() -> Self {
        Self {
            asks_per_node: 2,
            fail_on: Vec::new(),
            transient_failures: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Set how many asks each parent node makes before submitting (builder)
    pub fn with_asks_per_node(mut self, asks: usize) -> Self {
        self.asks_per_node = asks;
        self
    }

    /// Fail fatally whenever the request prompt contains `needle` (builder)
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on.push(needle.into());
        self
    }

    /// Fail the first `count` calls transiently (builder)
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// All calls so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn parent_turn(&self, transcript: &str) -> String {
        let answered = transcript.matches("<response>").count();
        if answered < self.asks_per_node {
            let n = answered + 1;
            return format!("<notes>Step {n}</notes>\n<ask>Part {n} of $PROMPT</ask>");
        }

        let combined: Vec<String> = (1..=answered).map(|k| format!("$RESPONSE{k}")).collect();
        if combined.is_empty() {
            "<submit>Direct answer</submit>".to_string()
        } else {
            format!("<submit>Combined: {}</submit>", combined.join(" + "))
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        self.calls.lock().push(RecordedCall {
            mode: request.mode,
            prompt: request.prompt.clone(),
            examples: request.examples.len(),
        });

        let pending = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(BackendError::Transient("injected".into()));
        }

        if let Some(needle) = self.fail_on.iter().find(|n| request.prompt.contains(n.as_str())) {
            return Err(BackendError::Fatal(format!("injected failure for {needle:?}")));
        }

        Ok(match request.mode {
            GenerationMode::Leaf => format!("Answer to: {}", request.prompt),
            GenerationMode::Parent => self.parent_turn(&request.prompt),
        })
    }
}
