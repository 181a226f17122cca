//! Channels for interactive (human) authoring of parent sessions

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::agent::{AuthorTurn, ParentAuthor};
use crate::document::ExamplePools;
use crate::error::GenerationError;
use crate::generator::{Authored, SessionSource, TreeGenerator};
use crate::script::{self, ScriptEvent};
use crate::session::Session;

/// Character limits on a human-authored parent session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthoringLimits {
    /// Cumulative characters across every authored event
    pub total_chars: usize,
    /// Characters in the submit alone
    pub submit_chars: usize,
}

impl Default for AuthoringLimits {
    fn default() -> Self {
        Self {
            total_chars: 2_000,
            submit_chars: 500,
        }
    }
}

impl AuthoringLimits {
    /// Check a proposed turn against the node's existing events
    pub fn check(&self, node: &Session, events: &[ScriptEvent]) -> Result<(), String> {
        if !events.last().is_some_and(ScriptEvent::is_terminal) {
            return Err("turn must end with an ask or a submit".to_string());
        }

        let added: usize = events.iter().map(|e| e.text().chars().count()).sum();
        let total = node.event_chars() + added;
        if total > self.total_chars {
            return Err(format!(
                "session would have {total} characters, limit is {}",
                self.total_chars
            ));
        }

        if let Some(ScriptEvent::Submit(text)) = events.last() {
            let len = text.chars().count();
            if len > self.submit_chars {
                return Err(format!(
                    "submit has {len} characters, limit is {}",
                    self.submit_chars
                ));
            }
        }
        Ok(())
    }
}

/// Reply from the human author
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthoringReply {
    Events(Vec<ScriptEvent>),
    Skip,
}

/// One request for the next turn of a human-authored node
#[derive(Debug)]
pub struct AuthoringRequest {
    pub prompt: String,
    /// Rendered transcript of the node so far
    pub transcript: String,
    pub depth_budget: usize,
    pub limits: AuthoringLimits,
    /// Why the previous reply was rejected, if it was
    pub rejection: Option<String>,
    reply: oneshot::Sender<AuthoringReply>,
}

impl AuthoringRequest {
    /// Answer the request
    pub fn respond(self, reply: AuthoringReply) -> Result<(), ChannelError> {
        self.reply.send(reply).map_err(|_| ChannelError::Closed)
    }
}

/// Front-end side: receives authoring requests
pub struct AuthoringChannel {
    request_rx: mpsc::UnboundedReceiver<AuthoringRequest>,
}

impl AuthoringChannel {
    /// Receive the next request; `None` once the author side is dropped
    pub async fn recv(&mut self) -> Option<AuthoringRequest> {
        self.request_rx.recv().await
    }
}

/// Generator side: a [`ParentAuthor`] that forwards each turn to a human
#[derive(Clone)]
pub struct InteractiveAuthor {
    request_tx: mpsc::UnboundedSender<AuthoringRequest>,
    limits: AuthoringLimits,
}

impl InteractiveAuthor {
    pub fn limits(&self) -> AuthoringLimits {
        self.limits
    }

    async fn request(&self, node: &Session, depth_budget: usize, rejection: Option<String>) -> Result<AuthoringReply, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AuthoringRequest {
            prompt: node.prompt.clone(),
            transcript: script::render_transcript(node),
            depth_budget,
            limits: self.limits,
            rejection,
            reply: reply_tx,
        };
        self.request_tx.send(request).map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Closed)
    }
}

/// Create a connected author/front-end pair
pub fn authoring_channel(limits: AuthoringLimits) -> (InteractiveAuthor, AuthoringChannel) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    (
        InteractiveAuthor { request_tx, limits },
        AuthoringChannel { request_rx },
    )
}

#[async_trait]
impl ParentAuthor for InteractiveAuthor {
    async fn next_turn(&self, node: &Session, depth_budget: usize) -> Result<AuthorTurn, GenerationError> {
        let mut rejection = None;

        loop {
            let reply = self
                .request(node, depth_budget, rejection.take())
                .await
                .map_err(|e| GenerationError::Authoring(e.to_string()))?;

            let events = match reply {
                AuthoringReply::Skip => return Ok(AuthorTurn::Skip),
                AuthoringReply::Events(events) => script::truncate_at_terminal(events),
            };

            match self.limits.check(node, &events) {
                Ok(()) => return Ok(AuthorTurn::Events(events)),
                Err(reason) => {
                    debug!(node_id = node.id, %reason, "Rejected authored turn");
                    rejection = Some(reason);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "interactive"
    }
}

/// Parent sessions whose root is written by a human and whose children are
/// generated automatically
pub struct InteractiveSource {
    generator: TreeGenerator,
    author: Arc<InteractiveAuthor>,
}

impl InteractiveSource {
    pub fn new(generator: TreeGenerator, author: InteractiveAuthor) -> Self {
        Self {
            generator,
            author: Arc::new(author),
        }
    }
}

#[async_trait]
impl SessionSource for InteractiveSource {
    async fn build_session(
        &self,
        prompt: &str,
        depth_budget: usize,
        examples: &ExamplePools,
    ) -> Result<Authored, GenerationError> {
        let tree = self
            .generator
            .generate_tree_with(self.author.as_ref(), prompt, depth_budget, examples)
            .await?;
        Ok(match tree {
            Some(tree) => Authored::Session(tree),
            None => {
                info!(prompt, "Interactive author skipped prompt");
                Authored::Skipped
            }
        })
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,
}
