//! Text-generation backend adapter
//!
//! The backend is opaque: prompt, mode, few-shot examples and sampling
//! parameters in, generated text out. Calls are wrapped in a timeout and a
//! bounded exponential-backoff retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::ExampleDocument;
use crate::error::{BackendError, GenerationError};

/// Which kind of node the backend is asked to write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Answer directly, no delegation
    Leaf,
    /// Continue a transcript with notes and one ask or submit
    Parent,
}

impl std::fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationMode::Leaf => write!(f, "leaf"),
            GenerationMode::Parent => write!(f, "parent"),
        }
    }
}

/// Model and sampling parameters shared by every call of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A single backend call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Raw prompt in leaf mode, rendered transcript in parent mode
    pub prompt: String,
    pub mode: GenerationMode,
    /// Few-shot examples for this mode
    pub examples: Arc<ExampleDocument>,
    pub params: SamplingParams,
}

/// A text-generation backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Generate text for a request
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;
}

/// Bounded retry with exponential backoff and a per-call timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            timeout_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Call the backend, retrying transient failures and timeouts.
///
/// Exhausting the policy, or any fatal failure, becomes
/// [`GenerationError::Backend`].
pub async fn generate_with_retry(
    backend: &dyn Backend,
    request: &GenerationRequest,
    policy: &RetryPolicy,
) -> Result<String, GenerationError> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let outcome = match tokio::time::timeout(policy.timeout(), backend.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(policy.timeout())),
        };

        match outcome {
            Ok(text) => {
                debug!(mode = %request.mode, attempts, "Backend call succeeded");
                return Ok(text);
            }
            Err(e) if e.is_transient() && attempts <= policy.max_retries => {
                let delay = policy.backoff(attempts - 1);
                warn!(
                    mode = %request.mode,
                    attempt = attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => return Err(GenerationError::Backend { attempts, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: AtomicU32,
        error: BackendError,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: u32, error: BackendError) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                error,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Backend for Flaky {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
            tokio::time::sleep(self.delay).await;
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok("ok".into())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "P".into(),
            mode: GenerationMode::Leaf,
            examples: Arc::new(ExampleDocument::default()),
            params: SamplingParams {
                model: "test".into(),
                temperature: 0.7,
                max_tokens: 64,
            },
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            timeout_ms: 1_000,
        }
    }

    // === Backoff Tests ===

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(8_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(8_000));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(GenerationMode::Leaf.to_string(), "leaf");
        assert_eq!(GenerationMode::Parent.to_string(), "parent");
    }

    // === Retry Tests ===

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Flaky::new(2, BackendError::Transient("rate limited".into()));
        let text = generate_with_retry(&backend, &request(), &fast_policy(3)).await;
        assert_eq!(tokio_test::assert_ok!(text), "ok");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let backend = Flaky::new(5, BackendError::Transient("down".into()));
        let err = generate_with_retry(&backend, &request(), &fast_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Backend { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_fatal_failure_not_retried() {
        let backend = Flaky::new(1, BackendError::Fatal("bad request".into()));
        let err = generate_with_retry(&backend, &request(), &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Backend { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let mut backend = Flaky::new(0, BackendError::Fatal("unused".into()));
        backend.delay = Duration::from_millis(200);
        let policy = RetryPolicy {
            timeout_ms: 10,
            ..fast_policy(1)
        };

        let err = generate_with_retry(&backend, &request(), &policy).await.unwrap_err();
        match err {
            GenerationError::Backend { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, BackendError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
