//! The consultation endpoint: one conversational turn per request.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::api::ApiError;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ChatbotQueryInput {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 1, max = 8000))]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatbotQueryOutput {
    pub input: String,
    pub output: String,
}

pub async fn covid_consultation(
    State(state): State<UnifiedAppState>,
    Json(query): Json<ChatbotQueryInput>,
) -> Result<Json<ChatbotQueryOutput>, ApiError> {
    query.validate()?;
    info!("Consultation turn for user {}", query.user_id);

    let result = state.orchestrator.submit_turn(&query.user_id, &query.text).await;
    crate::metrics::inc_request("/covid-consultation", if result.is_ok() { "ok" } else { "error" });

    let reply = result?;
    Ok(Json(ChatbotQueryOutput { input: query.text, output: reply.answer }))
}
