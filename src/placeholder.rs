//! `$PROMPT` / `$RESPONSE{k}` resolution against a node's local history

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ResolveError;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:PROMPT|RESPONSE\d+)").expect("Invalid placeholder regex")
});

const PROMPT_TOKEN: &str = "$PROMPT";
const RESPONSE_PREFIX: &str = "$RESPONSE";

/// A parsed placeholder token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// The node's own prompt
    Prompt,
    /// The k-th response recorded at the node, 1-indexed by arrival.
    /// `None` when the digits do not fit in a `usize`.
    Response(Option<usize>),
}

impl Placeholder {
    fn parse(token: &str) -> Self {
        if token == PROMPT_TOKEN {
            Placeholder::Prompt
        } else {
            Placeholder::Response(token[RESPONSE_PREFIX.len()..].parse().ok())
        }
    }
}

/// All placeholder tokens in `text`, in order of appearance
pub fn placeholders(text: &str) -> Vec<Placeholder> {
    PLACEHOLDER
        .find_iter(text)
        .map(|m| Placeholder::parse(m.as_str()))
        .collect()
}

/// Whether `text` still carries any placeholder token
pub fn contains_placeholder(text: &str) -> bool {
    PLACEHOLDER.is_match(text)
}

/// Resolve every token in `text` against `prompt` and the responses recorded
/// so far. Substituted text is not rescanned.
pub fn resolve<S: AsRef<str>>(
    text: &str,
    prompt: &str,
    responses: &[S],
) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for m in PLACEHOLDER.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        let replacement = match Placeholder::parse(m.as_str()) {
            Placeholder::Prompt => prompt,
            Placeholder::Response(Some(k)) if k >= 1 && k <= responses.len() => {
                responses[k - 1].as_ref()
            }
            Placeholder::Response(_) => {
                return Err(ResolveError::UnresolvedPlaceholder {
                    token: m.as_str().to_string(),
                    available: responses.len(),
                })
            }
        };
        out.push_str(replacement);
        last = m.end();
    }

    out.push_str(&text[last..]);
    Ok(out)
}

/// Leaf outputs have nothing to reference
pub fn ensure_leaf(text: &str) -> Result<(), ResolveError> {
    match PLACEHOLDER.find(text) {
        Some(m) => Err(ResolveError::PlaceholderInLeaf {
            token: m.as_str().to_string(),
        }),
        None => Ok(()),
    }
}
