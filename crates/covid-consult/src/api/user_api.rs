//! Registration and login.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::api::ApiError;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize, Validate)]
pub struct UserRequest {
    #[validate(length(min = 1, max = 128))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(default)]
    pub is_register: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub message: String,
    pub user_id: String,
}

pub async fn user_request(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    payload.validate()?;

    let user_id = state
        .orchestrator
        .register_or_login(&payload.username, &payload.password, payload.is_register)
        .await?;

    let message = if payload.is_register {
        info!("Registered user {}", user_id);
        "User registered"
    } else {
        info!("User {} logged in", user_id);
        "Login successful"
    };
    Ok(Json(UserResponse { message: message.to_string(), user_id }))
}
