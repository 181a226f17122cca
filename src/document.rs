//! On-disk documents: session trees, example pools and JSON persistence
//!
//! A tree is stored as its root's document with each child embedded at the
//! response it produced. Example documents hold flat session fragments:
//! parent fragments keep the authored event structure, leaf fragments only a
//! prompt and a submit.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::backend::GenerationMode;
use crate::error::DocumentError;
use crate::hierarchy::SessionTree;
use crate::session::{Event, Session};

/// Serialized form of one node and, through its responses, its subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub id: usize,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventDocument>,
    pub submit: String,
    pub final_response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDocument {
    Notes {
        text: String,
    },
    Ask {
        text: String,
    },
    Response {
        response_id: usize,
        text: String,
        session: Box<SessionDocument>,
    },
}

impl SessionDocument {
    fn from_node(tree: &SessionTree, node: &Session) -> Self {
        let events = node
            .events
            .iter()
            .map(|event| match event {
                Event::Note(text) => EventDocument::Notes { text: text.clone() },
                Event::Ask(text) => EventDocument::Ask { text: text.clone() },
                Event::Response { child_id, text } => EventDocument::Response {
                    response_id: *child_id,
                    text: text.clone(),
                    session: Box::new(match tree.get(*child_id) {
                        Some(child) => Self::from_node(tree, child),
                        None => SessionDocument::missing(*child_id),
                    }),
                },
            })
            .collect();

        Self {
            id: node.id,
            prompt: node.prompt.clone(),
            events,
            submit: node.submit.clone().unwrap_or_default(),
            final_response: node.final_response.clone().unwrap_or_default(),
        }
    }

    // Only reachable for trees that bypassed validation; rejected on load
    fn missing(id: usize) -> Self {
        Self {
            id,
            prompt: String::new(),
            events: Vec::new(),
            submit: String::new(),
            final_response: String::new(),
        }
    }

    fn flatten(self, depth: usize, nodes: &mut Vec<Session>) {
        let index = nodes.len();
        nodes.push(Session::new(self.id, depth, self.prompt));

        for event in self.events {
            let event = match event {
                EventDocument::Notes { text } => Event::Note(text),
                EventDocument::Ask { text } => Event::Ask(text),
                EventDocument::Response {
                    response_id,
                    text,
                    session,
                } => {
                    session.flatten(depth + 1, nodes);
                    Event::Response {
                        child_id: response_id,
                        text,
                    }
                }
            };
            nodes[index].events.push(event);
        }

        nodes[index].complete(self.submit, self.final_response);
    }
}

impl From<&SessionTree> for SessionDocument {
    fn from(tree: &SessionTree) -> Self {
        Self::from_node(tree, tree.root())
    }
}

impl TryFrom<SessionDocument> for SessionTree {
    type Error = DocumentError;

    fn try_from(doc: SessionDocument) -> Result<Self, Self::Error> {
        let mut nodes = Vec::new();
        doc.flatten(0, &mut nodes);
        SessionTree::from_nodes(nodes)
    }
}

/// One example event; parent fragments keep placeholders as authored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExampleEvent {
    Notes { text: String },
    Ask { text: String },
    Response { text: String },
}

/// A session fragment used as a few-shot example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleSession {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ExampleEvent>,
    pub submit: String,
}

impl ExampleSession {
    /// Whole root node, unresolved
    pub fn parent(root: &Session) -> Self {
        Self {
            prompt: root.prompt.clone(),
            events: root
                .events
                .iter()
                .map(|event| match event {
                    Event::Note(text) => ExampleEvent::Notes { text: text.clone() },
                    Event::Ask(text) => ExampleEvent::Ask { text: text.clone() },
                    Event::Response { text, .. } => ExampleEvent::Response { text: text.clone() },
                })
                .collect(),
            submit: root.submit.clone().unwrap_or_default(),
        }
    }

    /// Resolved prompt and final response only
    pub fn leaf(prompt: impl Into<String>, final_response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            events: Vec::new(),
            submit: final_response.into(),
        }
    }
}

/// A collection of example fragments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleDocument {
    #[serde(default)]
    pub sessions: Vec<ExampleSession>,
}

impl ExampleDocument {
    pub fn new(sessions: Vec<ExampleSession>) -> Self {
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        read_json(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        write_json_atomic(path, self)
    }
}

/// Example pools seeding one round of generation
#[derive(Debug, Clone, Default)]
pub struct ExamplePools {
    pub leaf: Arc<ExampleDocument>,
    pub parent: Arc<ExampleDocument>,
}

impl ExamplePools {
    pub fn new(leaf: ExampleDocument, parent: ExampleDocument) -> Self {
        Self {
            leaf: Arc::new(leaf),
            parent: Arc::new(parent),
        }
    }

    pub fn for_mode(&self, mode: GenerationMode) -> Arc<ExampleDocument> {
        match mode {
            GenerationMode::Leaf => Arc::clone(&self.leaf),
            GenerationMode::Parent => Arc::clone(&self.parent),
        }
    }
}

/// Read a JSON document
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, DocumentError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| DocumentError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| DocumentError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Write a JSON document through a temporary file in the same directory,
/// renamed into place once fully written.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), DocumentError> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| DocumentError::io(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| DocumentError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        writer.flush().map_err(|e| DocumentError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| DocumentError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| DocumentError::io(path, e.error))?;
    Ok(())
}

/// Save a tree as a nested session document
pub fn save_tree(path: impl AsRef<Path>, tree: &SessionTree) -> Result<(), DocumentError> {
    write_json_atomic(path, &SessionDocument::from(tree))
}

/// Load and validate a tree
pub fn load_tree(path: impl AsRef<Path>) -> Result<SessionTree, DocumentError> {
    let path = path.as_ref();
    let doc: SessionDocument = read_json(path)?;
    SessionTree::try_from(doc).map_err(|e| match e {
        DocumentError::Structure(message) => DocumentError::Parse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tests::sample_tree;
    use tempfile::TempDir;

    // === Tree Document Tests ===

    #[test]
    fn test_tree_round_trip() {
        let tree = sample_tree();
        let doc = SessionDocument::from(&tree);
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: SessionDocument = serde_json::from_str(&json).unwrap();
        let back = SessionTree::try_from(parsed).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_children_embedded_at_responses() {
        let doc = SessionDocument::from(&sample_tree());
        let embedded: Vec<usize> = doc
            .events
            .iter()
            .filter_map(|e| match e {
                EventDocument::Response { session, .. } => Some(session.id),
                _ => None,
            })
            .collect();
        assert_eq!(embedded, vec![1, 3]);
    }

    #[test]
    fn test_document_from_json_text() {
        let json = r#"{
            "id": 0,
            "prompt": "P",
            "events": [
                {"type": "ask", "text": "$PROMPT do X"},
                {"type": "response", "response_id": 1, "text": "R1",
                 "session": {"id": 1, "prompt": "P do X", "submit": "R1", "final_response": "R1"}}
            ],
            "submit": "Use $RESPONSE1",
            "final_response": "Use R1"
        }"#;
        let doc: SessionDocument = serde_json::from_str(json).unwrap();
        let tree = SessionTree::try_from(doc).unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.children(0), vec![1]);
        assert_eq!(tree.depth(1), Some(1));
        assert_eq!(tree.final_response(), "Use R1");
    }

    #[test]
    fn test_load_tree_rejects_bad_structure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        let mut doc = SessionDocument::from(&sample_tree());
        doc.final_response = "$RESPONSE1".into();
        write_json_atomic(&path, &doc).unwrap();

        assert!(matches!(load_tree(&path), Err(DocumentError::Parse { .. })));
    }

    #[test]
    fn test_load_tree_rejects_malformed_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"id\": 0, \"prompt\": ").unwrap();
        assert!(matches!(load_tree(&path), Err(DocumentError::Parse { .. })));
    }

    #[test]
    fn test_save_and_load_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        save_tree(&path, &sample_tree()).unwrap();
        assert_eq!(load_tree(&path).unwrap(), sample_tree());
    }

    // === Example Document Tests ===

    #[test]
    fn test_parent_example_keeps_placeholders() {
        let tree = sample_tree();
        let example = ExampleSession::parent(tree.root());
        assert_eq!(example.prompt, "root");
        assert_eq!(example.events.len(), 4);
        assert_eq!(example.submit, "$RESPONSE1 $RESPONSE2");
    }

    #[test]
    fn test_leaf_example_serializes_without_events() {
        let example = ExampleSession::leaf("P", "answer");
        let json = serde_json::to_value(&example).unwrap();
        assert!(json.get("events").is_none());
        assert_eq!(json["submit"], "answer");
    }

    #[test]
    fn test_example_document_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("examples.json");
        let doc = ExampleDocument::new(vec![ExampleSession::leaf("P", "A")]);
        doc.save(&path).unwrap();
        assert_eq!(ExampleDocument::load(&path).unwrap(), doc);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let value: Vec<u32> = read_json(&path).unwrap();
        assert_eq!(value, vec![4]);
    }

    #[test]
    fn test_pools_for_mode() {
        let pools = ExamplePools::new(
            ExampleDocument::new(vec![ExampleSession::leaf("P", "A")]),
            ExampleDocument::default(),
        );
        assert_eq!(pools.for_mode(GenerationMode::Leaf).len(), 1);
        assert!(pools.for_mode(GenerationMode::Parent).is_empty());
    }
}
