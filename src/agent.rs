//! Parent-node authors: whoever writes a delegating node's notes, asks and
//! submit, one turn at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{generate_with_retry, Backend, GenerationMode, GenerationRequest, RetryPolicy, SamplingParams};
use crate::document::ExampleDocument;
use crate::error::GenerationError;
use crate::script::{self, ScriptEvent};
use crate::session::Session;

/// Result of one authoring turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorTurn {
    /// Notes followed by exactly one ask or submit
    Events(Vec<ScriptEvent>),
    /// Author declined the prompt
    Skip,
}

/// Writes parent nodes turn by turn.
///
/// Each turn sees the node as it stands (prompt plus events so far) and
/// returns notes ending in one ask or a submit. After an ask the generator
/// builds the child subtree, records its response and asks for the next turn.
#[async_trait]
pub trait ParentAuthor: Send + Sync {
    /// Produce the next turn for `node`
    async fn next_turn(&self, node: &Session, depth_budget: usize) -> Result<AuthorTurn, GenerationError>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Author backed by a generation backend in parent mode
pub struct BackendAuthor {
    backend: Arc<dyn Backend>,
    examples: Arc<ExampleDocument>,
    params: SamplingParams,
    retry: RetryPolicy,
}

impl BackendAuthor {
    pub fn new(
        backend: Arc<dyn Backend>,
        examples: Arc<ExampleDocument>,
        params: SamplingParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            examples,
            params,
            retry,
        }
    }
}

#[async_trait]
impl ParentAuthor for BackendAuthor {
    async fn next_turn(&self, node: &Session, depth_budget: usize) -> Result<AuthorTurn, GenerationError> {
        let request = GenerationRequest {
            prompt: script::render_transcript(node),
            mode: GenerationMode::Parent,
            examples: Arc::clone(&self.examples),
            params: self.params.clone(),
        };

        let text = generate_with_retry(self.backend.as_ref(), &request, &self.retry).await?;
        let events = script::parse_script(&text)?;

        debug!(
            node_id = node.id,
            depth_budget,
            events = events.len(),
            "Backend authored parent turn"
        );
        Ok(AuthorTurn::Events(events))
    }

    fn name(&self) -> &str {
        "backend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::session::Event;

    fn author(backend: Arc<MockBackend>) -> BackendAuthor {
        BackendAuthor::new(
            backend,
            Arc::new(ExampleDocument::default()),
            SamplingParams {
                model: "mock".into(),
                temperature: 0.7,
                max_tokens: 128,
            },
            RetryPolicy {
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_backend_author_first_turn() {
        let backend = Arc::new(MockBackend::new().with_asks_per_node(1));
        let author = author(Arc::clone(&backend));
        let node = Session::new(0, 0, "Write a poem");

        let turn = author.next_turn(&node, 1).await.unwrap();
        assert_eq!(
            turn,
            AuthorTurn::Events(vec![
                ScriptEvent::Notes("Step 1".into()),
                ScriptEvent::Ask("Part 1 of $PROMPT".into()),
            ])
        );

        let calls = backend.calls();
        assert_eq!(calls[0].mode, GenerationMode::Parent);
        assert_eq!(calls[0].prompt, "<prompt>Write a poem</prompt>\n");
        assert_eq!(author.name(), "backend");
    }

    #[tokio::test]
    async fn test_backend_author_sees_responses() {
        let backend = Arc::new(MockBackend::new().with_asks_per_node(1));
        let author = author(backend);
        let mut node = Session::new(0, 0, "P");
        node.push_event(Event::Ask("Part 1 of $PROMPT".into())).unwrap();
        node.push_event(Event::Response {
            child_id: 1,
            text: "done".into(),
        })
        .unwrap();

        let turn = author.next_turn(&node, 1).await.unwrap();
        assert_eq!(
            turn,
            AuthorTurn::Events(vec![ScriptEvent::Submit("Combined: $RESPONSE1".into())])
        );
    }

    #[tokio::test]
    async fn test_backend_author_propagates_failure() {
        let backend = Arc::new(MockBackend::new().fail_on("doomed"));
        let author = author(backend);
        let result = author.next_turn(&Session::new(0, 0, "doomed prompt"), 1).await;
        assert!(matches!(result, Err(GenerationError::Backend { .. })));
    }
}
