//! Context engine module - sequences retrieval, generation, extraction and
//! memory writes for one conversational turn.

pub mod collaborators;
pub mod context_builder;
pub mod orchestrator;
pub mod prompts;

pub use collaborators::{AnswerGenerator, ProfileExtractor};
pub use context_builder::{BuiltContext, ContextBuilder};
pub use orchestrator::{OrchestratorConfig, TurnOrchestrator, TurnReply};
