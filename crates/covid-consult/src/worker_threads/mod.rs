//! Workers that front the remote language model.

pub mod llm_worker;

pub use llm_worker::LLMWorker;
