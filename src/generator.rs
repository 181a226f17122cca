//! Recursive delegation-tree generation

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::agent::{AuthorTurn, BackendAuthor, ParentAuthor};
use crate::backend::{generate_with_retry, Backend, GenerationMode, GenerationRequest, RetryPolicy, SamplingParams};
use crate::document::ExamplePools;
use crate::error::GenerationError;
use crate::hierarchy::SessionTree;
use crate::placeholder;
use crate::script::{self, ScriptEvent};
use crate::session::{Event, Session};

/// Default cumulative event characters per node before a forced submit
pub const DEFAULT_SESSION_CHAR_BUDGET: usize = 20_000;

/// Outcome of asking a source for a root session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authored {
    Session(SessionTree),
    /// The author declined the prompt
    Skipped,
}

/// Anything that can produce a completed tree for a prompt and depth budget.
///
/// Implemented by [`TreeGenerator`] (fully automated) and by the interactive
/// collaborator, so orchestration never branches on authorship.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn build_session(
        &self,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<Authored, GenerationError>;
}

type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<usize>, GenerationError>> + Send + 'a>>;

/// Builds delegation trees with a backend.
///
/// Generation inside one tree is strictly sequential: a child subtree
/// completes before its parent takes its next turn. Separate trees share
/// nothing and can be generated concurrently from clones.
#[derive(Clone)]
pub struct TreeGenerator {
    backend: Arc<dyn Backend>,
    params: SamplingParams,
    retry: RetryPolicy,
    session_char_budget: usize,
}

impl TreeGenerator {
    /// Create a generator
    pub fn new(backend: Arc<dyn Backend>, params: SamplingParams, retry: RetryPolicy) -> Self {
        Self {
            backend,
            params,
            retry,
            session_char_budget: DEFAULT_SESSION_CHAR_BUDGET,
        }
    }

    /// Set the per-node character budget (builder)
    pub fn with_char_budget(mut self, chars: usize) -> Self {
        self.session_char_budget = chars;
        self
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Generate a complete tree, every node written by the backend.
    ///
    /// `depth_budget == 0` yields a single leaf. Any failure discards the
    /// whole tree.
    pub async fn generate_tree(
        &self,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<SessionTree, GenerationError> {
        match self.run(None, prompt, depth_budget, examples).await? {
            Some(tree) => Ok(tree),
            None => Err(GenerationError::Validation("backend author skipped a prompt".into())),
        }
    }

    /// Generate a tree whose root is written by `root_author`; descendants
    /// are written by the backend. Returns `None` when the author skips.
    pub async fn generate_tree_with(
        &self,
        root_author: &dyn ParentAuthor,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<Option<SessionTree>, GenerationError> {
        self.run(Some(root_author), prompt, depth_budget, examples).await
    }

    async fn run(
        &self,
        root_author: Option<&dyn ParentAuthor>,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<Option<SessionTree>, GenerationError> {
        if placeholder::contains_placeholder(prompt) {
            return Err(GenerationError::Validation(format!(
                "root prompt contains a placeholder token: {prompt:?}"
            )));
        }

        let mut nodes = Vec::new();
        let root = self
            .build_node(root_author, &mut nodes, prompt.to_string(), 0, depth_budget, examples)
            .await?;
        if root.is_none() {
            info!(author = root_author.map(|a| a.name()), "Root prompt skipped by author");
            return Ok(None);
        }

        let tree = SessionTree::from_nodes(nodes)
            .map_err(|e| GenerationError::Validation(e.to_string()))?;
        debug!(nodes = tree.len(), max_depth = tree.max_depth(), "Tree generated");
        Ok(Some(tree))
    }

    async fn leaf_output(&self, prompt: &str, examples: &ExamplePools) -> Result<String, GenerationError> {
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            mode: GenerationMode::Leaf,
            examples: examples.for_mode(GenerationMode::Leaf),
            params: self.params.clone(),
        };
        let raw = generate_with_retry(self.backend.as_ref(), &request, &self.retry).await?;
        let text = script::parse_leaf_output(&raw)?;
        placeholder::ensure_leaf(&text)?;
        Ok(text)
    }

    /// Build one node and its subtree. The node takes the next pre-order id
    /// (its position in `nodes`); `None` means the author skipped it.
    fn build_node<'a>(
        &'a self,
        author: Option<&'a dyn ParentAuthor>,
        nodes: &'a mut Vec<Session>,
        prompt: String,
        depth: usize,
        depth_budget: usize,
        examples: &'a ExamplePools,
    ) -> NodeFuture<'a> {
        Box::pin(async move {
            let id = nodes.len();
            nodes.push(Session::new(id, depth, prompt.clone()));

            if depth_budget == 0 {
                let text = self.leaf_output(&prompt, examples).await?;
                debug!(node_id = id, depth, "Leaf completed");
                nodes[id].complete(text.clone(), text);
                return Ok(Some(id));
            }

            let backend_author;
            let author: &dyn ParentAuthor = match author {
                Some(author) => author,
                None => {
                    backend_author = BackendAuthor::new(
                        Arc::clone(&self.backend),
                        examples.for_mode(GenerationMode::Parent),
                        self.params.clone(),
                        self.retry.clone(),
                    );
                    &backend_author
                }
            };

            loop {
                if nodes[id].event_chars() > self.session_char_budget {
                    self.force_submit(&mut nodes[id])?;
                    return Ok(Some(id));
                }

                let events = match author.next_turn(&nodes[id], depth_budget).await? {
                    AuthorTurn::Events(events) => events,
                    AuthorTurn::Skip if id == 0 => {
                        nodes.clear();
                        return Ok(None);
                    }
                    AuthorTurn::Skip => {
                        return Err(GenerationError::Validation(format!(
                            "author skipped non-root session {id}"
                        )))
                    }
                };

                let chars_before = nodes[id].event_chars();
                let mut asked = false;
                for event in events {
                    match event {
                        ScriptEvent::Notes(text) => nodes[id].push_event(Event::Note(text))?,
                        ScriptEvent::Ask(text) => {
                            let child_prompt = nodes[id].resolve(&text)?;
                            nodes[id].push_event(Event::Ask(text))?;

                            let child_id = self
                                .build_node(None, nodes, child_prompt, depth + 1, depth_budget - 1, examples)
                                .await?
                                .ok_or_else(|| {
                                    GenerationError::Validation(format!("child of session {id} skipped"))
                                })?;
                            let text = nodes[child_id].final_response.clone().ok_or_else(|| {
                                GenerationError::Validation(format!("session {child_id} has no final response"))
                            })?;
                            nodes[id].push_event(Event::Response { child_id, text })?;
                            asked = true;
                            break;
                        }
                        ScriptEvent::Submit(text) => {
                            let final_response = nodes[id].resolve(&text)?;
                            debug!(node_id = id, depth, "Parent completed");
                            nodes[id].complete(text, final_response);
                            return Ok(Some(id));
                        }
                    }
                }

                if !asked && nodes[id].event_chars() == chars_before {
                    return Err(GenerationError::Validation(format!(
                        "turn for session {id} added nothing"
                    )));
                }
            }
        })
    }

    /// Over budget: submit the most recent response as-is
    fn force_submit(&self, node: &mut Session) -> Result<(), GenerationError> {
        let latest = node.response_count();
        if latest == 0 {
            return Err(GenerationError::BudgetExhausted);
        }

        warn!(
            node_id = node.id,
            chars = node.event_chars(),
            budget = self.session_char_budget,
            "Session character budget exceeded, forcing submit"
        );
        let submit = format!("$RESPONSE{latest}");
        let final_response = node.resolve(&submit)?;
        node.complete(submit, final_response);
        Ok(())
    }
}

#[async_trait]
impl SessionSource for TreeGenerator {
    async fn build_session(
        &self,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<Authored, GenerationError> {
        self.generate_tree(prompt, depth_budget, examples)
            .await
            .map(Authored::Session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SessionDocument;
    use crate::error::{BackendError, ResolveError};
    use crate::mock::MockBackend;
    use proptest::prelude::*;

    fn params() -> SamplingParams {
        SamplingParams {
            model: "mock".into(),
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            timeout_ms: 5_000,
        }
    }

    fn generator(backend: MockBackend) -> TreeGenerator {
        TreeGenerator::new(Arc::new(backend), params(), fast_retry())
    }

    /// Parent: ask "$PROMPT do X" once, then submit "Use $RESPONSE1".
    /// Leaf: "R1".
    struct OneAsk;

    #[async_trait]
    impl Backend for OneAsk {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
            Ok(match request.mode {
                GenerationMode::Leaf => "R1".into(),
                GenerationMode::Parent if request.prompt.contains("<response>") => {
                    "<submit>Use $RESPONSE1</submit>".into()
                }
                GenerationMode::Parent => "<ask>$PROMPT do X</ask>".into(),
            })
        }
    }

    /// Returns the same parent script forever
    struct Fixed(&'static str);

    #[async_trait]
    impl Backend for Fixed {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
            Ok(match request.mode {
                GenerationMode::Leaf => "leaf answer".into(),
                GenerationMode::Parent => self.0.into(),
            })
        }
    }

    // === Leaf Mode Tests ===

    #[tokio::test]
    async fn test_depth_zero_is_single_leaf() {
        let tree = generator(MockBackend::new())
            .generate_tree("P", 0, &ExamplePools::default())
            .await
            .unwrap();

        assert_eq!(tree.len(), 1);
        let root = tree.root();
        assert_eq!(root.submit.as_deref(), Some("Answer to: P"));
        assert_eq!(root.final_response.as_deref(), Some("Answer to: P"));
        assert!(root.events.is_empty());
    }

    #[tokio::test]
    async fn test_leaf_with_placeholder_fails() {
        let result = generator(MockBackend::new())
            .generate_tree("fine", 0, &ExamplePools::default())
            .await;
        assert!(result.is_ok());

        struct Leaky;
        #[async_trait]
        impl Backend for Leaky {
            async fn generate(&self, _r: &GenerationRequest) -> Result<String, BackendError> {
                Ok("see $RESPONSE1".into())
            }
        }
        let gen = TreeGenerator::new(Arc::new(Leaky), params(), fast_retry());
        let err = gen.generate_tree("P", 0, &ExamplePools::default()).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Resolve(ResolveError::PlaceholderInLeaf { .. })
        ));
    }

    // === Parent Mode Tests ===

    #[tokio::test]
    async fn test_single_ask_resolves_submit() {
        let gen = TreeGenerator::new(Arc::new(OneAsk), params(), fast_retry());
        let tree = gen.generate_tree("P", 1, &ExamplePools::default()).await.unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.children(0), vec![1]);
        assert_eq!(tree.get(1).unwrap().prompt, "P do X");
        assert_eq!(tree.depth(1), Some(1));
        assert_eq!(tree.final_response(), "Use R1");
        assert_eq!(tree.root().submit.as_deref(), Some("Use $RESPONSE1"));

        // Round trip through the document form
        let doc = SessionDocument::from(&tree);
        let json = serde_json::to_string_pretty(&doc).unwrap();
        let back = SessionTree::try_from(serde_json::from_str::<SessionDocument>(&json).unwrap()).unwrap();
        assert_eq!(back, tree);
    }

    #[tokio::test]
    async fn test_preorder_ids_across_subtrees() {
        let tree = generator(MockBackend::new().with_asks_per_node(2))
            .generate_tree("P", 2, &ExamplePools::default())
            .await
            .unwrap();

        // root, (a, a1, a2), (b, b1, b2)
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.children(0), vec![1, 4]);
        assert_eq!(tree.children(1), vec![2, 3]);
        assert_eq!(tree.children(4), vec![5, 6]);
        assert_eq!(tree.max_depth(), 2);
        assert_eq!(tree.get(5).unwrap().prompt, "Part 1 of Part 2 of P");
    }

    #[tokio::test]
    async fn test_final_response_is_resolved_and_stable() {
        let tree = generator(MockBackend::new())
            .generate_tree("P", 2, &ExamplePools::default())
            .await
            .unwrap();

        for node in tree.nodes() {
            let final_response = node.final_response.as_deref().unwrap();
            assert!(!placeholder::contains_placeholder(final_response));
            assert_eq!(node.resolve(final_response).unwrap(), final_response);
        }
    }

    #[tokio::test]
    async fn test_forward_reference_fails_tree() {
        let gen = TreeGenerator::new(Arc::new(Fixed("<submit>Use $RESPONSE3</submit>")), params(), fast_retry());
        let err = gen.generate_tree("P", 1, &ExamplePools::default()).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Resolve(ResolveError::UnresolvedPlaceholder { available: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_script_fails_tree() {
        let gen = TreeGenerator::new(Arc::new(Fixed("I refuse to use tags")), params(), fast_retry());
        let err = gen.generate_tree("P", 1, &ExamplePools::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Script(_)));
    }

    #[tokio::test]
    async fn test_empty_turn_fails_tree() {
        let gen = TreeGenerator::new(Arc::new(Fixed("<notes></notes>")), params(), fast_retry());
        let err = gen.generate_tree("P", 1, &ExamplePools::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_child_failure_discards_tree() {
        let backend = MockBackend::new().fail_on("Part 2 of");
        let result = generator(backend)
            .generate_tree("P", 1, &ExamplePools::default())
            .await;
        assert!(matches!(result, Err(GenerationError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_transient_failures_recover() {
        let backend = MockBackend::new().with_transient_failures(2);
        let tree = generator(backend)
            .generate_tree("P", 1, &ExamplePools::default())
            .await
            .unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[tokio::test]
    async fn test_placeholder_in_root_prompt_rejected() {
        let result = generator(MockBackend::new())
            .generate_tree("costs $PROMPT", 1, &ExamplePools::default())
            .await;
        assert!(matches!(result, Err(GenerationError::Validation(_))));
    }

    // === Character Budget Tests ===

    #[tokio::test]
    async fn test_budget_forces_submit_of_latest_response() {
        let tree = generator(MockBackend::new().with_asks_per_node(5))
            .with_char_budget(10)
            .generate_tree("P", 1, &ExamplePools::default())
            .await
            .unwrap();

        let root = tree.root();
        assert_eq!(root.response_count(), 1);
        assert_eq!(root.submit.as_deref(), Some("$RESPONSE1"));
        assert_eq!(root.final_response.as_deref(), Some("Answer to: Part 1 of P"));
    }

    #[tokio::test]
    async fn test_budget_without_response_fails() {
        let gen = TreeGenerator::new(Arc::new(Fixed("<notes>thinking a great deal</notes>")), params(), fast_retry())
            .with_char_budget(10);
        let err = gen.generate_tree("P", 1, &ExamplePools::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::BudgetExhausted));
    }

    // === Examples Tests ===

    #[tokio::test]
    async fn test_examples_passed_by_mode() {
        use crate::document::{ExampleDocument, ExampleSession};

        let backend = Arc::new(MockBackend::new().with_asks_per_node(1));
        let gen = TreeGenerator::new(backend.clone(), params(), fast_retry());
        let pools = ExamplePools::new(
            ExampleDocument::new(vec![ExampleSession::leaf("a", "b")]),
            ExampleDocument::new(vec![ExampleSession::leaf("c", "d"), ExampleSession::leaf("e", "f")]),
        );
        gen.generate_tree("P", 1, &pools).await.unwrap();

        for call in backend.calls() {
            match call.mode {
                GenerationMode::Leaf => assert_eq!(call.examples, 1),
                GenerationMode::Parent => assert_eq!(call.examples, 2),
            }
        }
    }

    // === Depth Properties ===

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_depth_bounded_and_ids_contiguous(budget in 0usize..4, asks in 0usize..3) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let tree = runtime
                .block_on(
                    generator(MockBackend::new().with_asks_per_node(asks))
                        .generate_tree("P", budget, &ExamplePools::default()),
                )
                .unwrap();

            prop_assert!(tree.max_depth() <= budget);
            if asks > 0 || budget == 0 {
                prop_assert_eq!(tree.max_depth(), budget);
            }
            let ids: Vec<usize> = tree.nodes().iter().map(|n| n.id).collect();
            prop_assert_eq!(ids, (0..tree.len()).collect::<Vec<_>>());
        }
    }
}
