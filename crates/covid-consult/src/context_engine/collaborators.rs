//! Contracts for the two language-model collaborators a turn depends on.

use async_trait::async_trait;

use crate::error::{ExtractionError, UpstreamError};
use crate::memory_db::ExtractedProfile;

/// Produces the consultant's answer from retrieved context and the question.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, context: &str, question: &str) -> Result<String, UpstreamError>;
}

/// Pulls profile facts (name, age, symptoms, conditions, family) out of a
/// user message.
#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract(&self, message: &str) -> Result<ExtractedProfile, ExtractionError>;
}
