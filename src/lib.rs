//! # Conclave
//!
//! Synthetic delegation-tree generation - the council that splits the work.
//!
//! This crate generates training examples for models that learn
//! hierarchical task delegation: a node may hand sub-prompts to child
//! nodes (recursively, up to a depth budget) and merges their responses
//! into its final answer. Generated trees seed the few-shot example pools
//! of the next round.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    EXPERIMENT (resumable state machine)             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │Prompt Sampler│  │Node Selector │  │  Aggregator  │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │ prompt + depth budget
//!                              ▼
//!                     ┌─────────────────┐       ┌──────────────────┐
//!                     │ Tree Generator  │◄─────►│ Backend / Author │
//!                     └────────┬────────┘       └──────────────────┘
//!                              │ one node per call, pre-order
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Ask $1    │     │   Ask $2    │     │   Submit    │
//!   │  (depth 1)  │     │  (depth 1)  │     │ "$RESPONSE1 │
//!   └──────┬──────┘     └──────┬──────┘     │ $RESPONSE2" │
//!          ▼                   ▼            └─────────────┘
//!      ┌───────┐           ┌───────┐
//!      │ leaf  │           │ leaf  │
//!      └───────┘           └───────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Session**: one node of a tree: prompt, events, submit, final response
//! - **Placeholder**: `$PROMPT` or `$RESPONSE{k}` inside an ask or submit
//! - **Iteration**: seven checkpointed steps from example pools to example pools
//! - **Experiment**: the resumable sequence of iterations

pub mod agent;
pub mod aggregator;
pub mod backend;
pub mod channel;
pub mod config;
pub mod document;
pub mod error;
pub mod generator;
pub mod hierarchy;
pub mod layout;
pub mod mock;
pub mod orchestrator;
pub mod placeholder;
pub mod sampler;
pub mod script;
pub mod selector;
pub mod session;

pub use agent::{AuthorTurn, BackendAuthor, ParentAuthor};
pub use aggregator::ExampleAggregator;
pub use backend::{Backend, GenerationMode, GenerationRequest, RetryPolicy, SamplingParams};
pub use channel::{authoring_channel, AuthoringChannel, AuthoringLimits, AuthoringReply, InteractiveAuthor, InteractiveSource};
pub use config::ExperimentConfig;
pub use document::{ExampleDocument, ExamplePools, ExampleSession, SessionDocument};
pub use error::{
    BackendError, DocumentError, ExperimentError, GenerationError, ResolveError, SamplerError, ScriptError,
};
pub use generator::{Authored, SessionSource, TreeGenerator};
pub use hierarchy::SessionTree;
pub use layout::Step;
pub use mock::MockBackend;
pub use orchestrator::{Experiment, ExperimentState, ExperimentSummary};
pub use sampler::{PromptPool, PromptSampler, SampledPrompt, UsedPrompts};
pub use selector::{NodeSelection, SelectedNode};
pub use session::{Event, Session};
