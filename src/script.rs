//! Event scripts: tagged text exchanged with backends and authors
//!
//! A node transcript is rendered as a sequence of tagged segments:
//!
//! ```text
//! <prompt>Write a story about robots</prompt>
//! <notes>Pick a robot first</notes>
//! <ask>What type of robot fits $PROMPT?</ask>
//! <response>A friendly cleaning robot</response>
//! <submit>A story about $RESPONSE1</submit>
//! ```
//!
//! Authors continue a transcript with notes followed by exactly one `ask` or
//! `submit`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScriptError;
use crate::session::{Event, Session};

static SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<([a-z-]+)>(.*?)</([a-z-]+)>").expect("Invalid segment regex")
});

/// One authored step of a parent node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum ScriptEvent {
    Notes(String),
    Ask(String),
    Submit(String),
}

impl ScriptEvent {
    pub fn text(&self) -> &str {
        match self {
            ScriptEvent::Notes(t) | ScriptEvent::Ask(t) | ScriptEvent::Submit(t) => t,
        }
    }

    /// Asks and submits end an authoring turn
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScriptEvent::Notes(_))
    }
}

/// Keep events up to and including the first ask or submit
pub fn truncate_at_terminal(mut events: Vec<ScriptEvent>) -> Vec<ScriptEvent> {
    if let Some(pos) = events.iter().position(ScriptEvent::is_terminal) {
        events.truncate(pos + 1);
    }
    events
}

fn segments(text: &str) -> Result<Vec<(String, String)>, ScriptError> {
    SEGMENT
        .captures_iter(text)
        .map(|caps| {
            let open = &caps[1];
            let close = &caps[3];
            if open != close {
                return Err(ScriptError::MismatchedTag {
                    open: open.to_string(),
                    close: close.to_string(),
                });
            }
            Ok((open.to_string(), caps[2].trim().to_string()))
        })
        .collect()
}

/// Parse a parent-mode continuation.
///
/// Only the events up to the first ask or submit are kept; anything after
/// was produced without seeing the child's response.
pub fn parse_script(text: &str) -> Result<Vec<ScriptEvent>, ScriptError> {
    let mut events = Vec::new();

    for (tag, body) in segments(text)? {
        let event = match tag.as_str() {
            "notes" => ScriptEvent::Notes(body),
            "ask" => ScriptEvent::Ask(body),
            "submit" => ScriptEvent::Submit(body),
            other => return Err(ScriptError::UnexpectedTag(other.to_string())),
        };
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    if events.is_empty() {
        return Err(ScriptError::Empty);
    }
    Ok(events)
}

/// Parse leaf-mode output: either a single `<submit>` segment or bare text
pub fn parse_leaf_output(text: &str) -> Result<String, ScriptError> {
    let segments = segments(text)?;

    let body = match segments.as_slice() {
        [] => text.trim().to_string(),
        [(tag, body)] if tag == "submit" => body.clone(),
        rest => {
            let offending = rest
                .iter()
                .find(|(tag, _)| tag != "submit")
                .unwrap_or(&rest[0]);
            return Err(ScriptError::UnexpectedTag(offending.0.clone()));
        }
    };

    if body.is_empty() {
        return Err(ScriptError::Empty);
    }
    Ok(body)
}

fn push_segment(out: &mut String, tag: &str, body: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(body);
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

/// Render a node's transcript so far, as authored (placeholders unresolved)
pub fn render_transcript(session: &Session) -> String {
    let mut out = String::new();
    push_segment(&mut out, "prompt", &session.prompt);

    for event in &session.events {
        match event {
            Event::Note(text) => push_segment(&mut out, "notes", text),
            Event::Ask(text) => push_segment(&mut out, "ask", text),
            Event::Response { text, .. } => push_segment(&mut out, "response", text),
        }
    }

    if let Some(submit) = &session.submit {
        push_segment(&mut out, "submit", submit);
    }
    out
}
