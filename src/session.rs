//! A single node of a delegation tree

use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, ResolveError};
use crate::placeholder;

/// Reserved text marking a failed generation. Never a valid final response.
pub const FAILED: &str = "FAILED";

/// Something that happened inside a node, in creation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Free-form reasoning
    Note(String),
    /// Delegation request, placeholders as authored.
    /// Owns the child created for it, which the following `Response` names.
    Ask(String),
    /// Final response of the child created for the preceding ask
    Response { child_id: usize, text: String },
}

impl Event {
    pub fn text(&self) -> &str {
        match self {
            Event::Note(t) | Event::Ask(t) => t,
            Event::Response { text, .. } => text,
        }
    }
}

/// One level of a delegation tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Pre-order id within the tree (root = 0)
    pub id: usize,
    /// Distance from the root
    pub depth: usize,
    /// Prompt, already resolved against the ancestors
    pub prompt: String,
    /// Events in creation order
    pub events: Vec<Event>,
    /// Closing statement as authored
    pub submit: Option<String>,
    /// `submit` with every placeholder resolved
    pub final_response: Option<String>,
}

impl Session {
    /// Create an empty node
    pub fn new(id: usize, depth: usize, prompt: impl Into<String>) -> Self {
        Self {
            id,
            depth,
            prompt: prompt.into(),
            events: Vec::new(),
            submit: None,
            final_response: None,
        }
    }

    /// Append an event. Nothing may follow the submit.
    pub fn push_event(&mut self, event: Event) -> Result<(), GenerationError> {
        if self.is_complete() {
            return Err(GenerationError::Validation(format!(
                "session {} already submitted",
                self.id
            )));
        }
        self.events.push(event);
        Ok(())
    }

    /// Record the submit and its resolved form
    pub fn complete(&mut self, submit: impl Into<String>, final_response: impl Into<String>) {
        self.submit = Some(submit.into());
        self.final_response = Some(final_response.into());
    }

    pub fn is_complete(&self) -> bool {
        self.submit.is_some()
    }

    /// Response texts in arrival order
    pub fn responses(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Response { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn response_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Response { .. }))
            .count()
    }

    /// Ids of the children owned by this node's asks, in ask order
    pub fn child_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.events.iter().filter_map(|e| match e {
            Event::Response { child_id, .. } => Some(*child_id),
            _ => None,
        })
    }

    /// Cumulative characters across all events
    pub fn event_chars(&self) -> usize {
        self.events.iter().map(|e| e.text().chars().count()).sum()
    }

    /// Resolve `text` against this node's prompt and responses so far
    pub fn resolve(&self, text: &str) -> Result<String, ResolveError> {
        placeholder::resolve(text, &self.prompt, &self.responses())
    }

    /// A node without asks
    pub fn is_leaf(&self) -> bool {
        !self.events.iter().any(|e| matches!(e, Event::Ask(_)))
    }

    /// Check the event sequence of a completed node: every ask immediately
    /// followed by its response, a submit, and a resolved final response.
    pub fn validate(&self) -> Result<(), String> {
        let mut expecting_response = false;

        for (i, event) in self.events.iter().enumerate() {
            match event {
                Event::Ask(_) if expecting_response => {
                    return Err(format!("session {}: ask at {i} before previous response", self.id));
                }
                Event::Ask(_) => expecting_response = true,
                Event::Response { .. } if !expecting_response => {
                    return Err(format!("session {}: response at {i} without ask", self.id));
                }
                Event::Response { .. } => expecting_response = false,
                Event::Note(_) if expecting_response => {
                    return Err(format!("session {}: note at {i} between ask and response", self.id));
                }
                Event::Note(_) => {}
            }
        }

        if expecting_response {
            return Err(format!("session {}: unpaired ask", self.id));
        }

        let final_response = self
            .final_response
            .as_deref()
            .ok_or_else(|| format!("session {}: missing final response", self.id))?;
        if self.submit.is_none() {
            return Err(format!("session {}: missing submit", self.id));
        }
        if final_response == FAILED {
            return Err(format!("session {}: failed session", self.id));
        }
        if placeholder::contains_placeholder(final_response) {
            return Err(format!("session {}: unresolved final response", self.id));
        }
        Ok(())
    }
}
