// covid-consult/crates/covid-consult/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory_db;
pub mod retry;
pub mod shared_state;
pub mod telemetry;
pub mod vector_index;
pub mod worker_threads;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod metrics;
#[cfg(feature = "cli")]
pub mod server;

#[cfg(test)]
pub mod test_support;

// Public API exports
pub use config::Config;
pub use context_engine::{AnswerGenerator, ProfileExtractor, TurnOrchestrator, TurnReply};
pub use error::{IndexError, StoreError, TurnError, UpstreamError};
pub use memory_db::MemoryDatabase;
pub use vector_index::VectorIndexEngine;
pub use worker_threads::LLMWorker;

#[cfg(feature = "cli")]
pub use server::run_server;
