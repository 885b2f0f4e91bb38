//! Mapping from library errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;
use validator::ValidationErrors;

use crate::error::{IndexError, StoreError, TurnError};

#[derive(Debug)]
pub enum ApiError {
    Turn(TurnError),
    Validation(String),
    Forbidden(String),
}

impl From<TurnError> for ApiError {
    fn from(e: TurnError) -> Self {
        Self::Turn(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Turn(e.into())
    }
}

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        Self::Turn(e.into())
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(e: ValidationErrors) -> Self {
        Self::Validation(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Turn(e) => match e {
                TurnError::Store(StoreError::DuplicateUsername(_)) => StatusCode::BAD_REQUEST,
                TurnError::Store(StoreError::InvalidRole(_)) => StatusCode::UNPROCESSABLE_ENTITY,
                TurnError::Store(StoreError::UserNotFound(_))
                | TurnError::Store(StoreError::UnknownUser(_))
                | TurnError::NoHistory(_) => StatusCode::NOT_FOUND,
                TurnError::Store(StoreError::BadCredential) => StatusCode::FORBIDDEN,
                TurnError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
                TurnError::Index(IndexError::NotLoaded) => StatusCode::SERVICE_UNAVAILABLE,
                TurnError::Index(IndexError::EmptyCorpus) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Validation(message) | Self::Forbidden(message) => message.clone(),
            Self::Turn(TurnError::Store(StoreError::UserNotFound(_)))
            | Self::Turn(TurnError::Store(StoreError::UnknownUser(_))) => "User not found".to_string(),
            Self::Turn(TurnError::Store(StoreError::DuplicateUsername(_))) => "Username already exists".to_string(),
            Self::Turn(TurnError::Store(StoreError::BadCredential)) => "Incorrect password".to_string(),
            Self::Turn(TurnError::NoHistory(_)) => "No chat history found for this user".to_string(),
            Self::Turn(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {:?}", status, self);
        }
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}
