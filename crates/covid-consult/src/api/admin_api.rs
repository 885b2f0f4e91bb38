//! Liveness, health and index maintenance.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::ApiError;
use crate::error::{IndexError, StoreError};
use crate::memory_db::DatabaseStats;
use crate::shared_state::UnifiedAppState;
use crate::vector_index::{load_corpus, IndexStats};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub index: IndexStats,
    pub database: DatabaseStats,
}

pub async fn root() -> Json<Value> {
    Json(json!({ "status": "running" }))
}

pub async fn health(State(state): State<UnifiedAppState>) -> Result<Json<HealthResponse>, ApiError> {
    let database = state.database.clone();
    let db_stats = tokio::task::spawn_blocking(move || database.get_stats())
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))??;

    let index = state.index.stats();
    Ok(Json(HealthResponse {
        status: if index.loaded { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        index,
        database: db_stats,
    }))
}

/// Re-embed the corpus and atomically swap the new index in. Queries keep
/// using the previous index until the new one is persisted. Requires
/// `Authorization: Bearer <ADMIN_TOKEN>`.
pub async fn rebuild_index(
    State(state): State<UnifiedAppState>,
    headers: HeaderMap,
) -> Result<Json<IndexStats>, ApiError> {
    require_admin(state.config.admin_token.as_deref(), &headers)?;
    let data_dir = state.config.data_directory.clone();
    let documents = tokio::task::spawn_blocking(move || load_corpus(&data_dir))
        .await
        .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;
    info!("Rebuilding index over {} documents", documents.len());

    state.index.build(documents).await?;
    Ok(Json(state.index.stats()))
}

fn require_admin(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::Forbidden("index rebuild is disabled: ADMIN_TOKEN is not set".to_string()));
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected) {
        warn!("Rejected index rebuild with missing or wrong admin token");
        return Err(ApiError::Forbidden("invalid admin token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_rebuild_disabled_without_configured_token() {
        let err = require_admin(None, &bearer("anything")).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(ref m) if m.contains("ADMIN_TOKEN")));
    }

    #[test]
    fn test_matching_bearer_token_is_accepted() {
        assert!(require_admin(Some("s3cret"), &bearer("s3cret")).is_ok());
        assert!(require_admin(Some("s3cret"), &bearer("s3cre")).is_err());
        assert!(require_admin(Some("s3cret"), &HeaderMap::new()).is_err());
    }
}
