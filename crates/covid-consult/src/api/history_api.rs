//! Conversation history, direct message storage and the accumulated profile.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use crate::api::ApiError;
use crate::memory_db::{StoredMessage, UserProfile};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct MessageStoreRequest {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 1))]
    pub text: String,
    pub role: String,
}

pub async fn chat_history(
    State(state): State<UnifiedAppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    Ok(Json(state.orchestrator.fetch_history(&user_id).await?))
}

pub async fn store_message(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<MessageStoreRequest>,
) -> Result<Json<Value>, ApiError> {
    payload.validate()?;
    state
        .orchestrator
        .record_message(&payload.user_id, &payload.text, &payload.role)
        .await?;
    Ok(Json(json!({ "message": "Message stored successfully" })))
}

pub async fn user_profile(
    State(state): State<UnifiedAppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    Ok(Json(state.orchestrator.get_profile(&user_id).await?))
}
