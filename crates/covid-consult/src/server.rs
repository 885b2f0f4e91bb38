//! HTTP server
//!
//! Startup order: tracing and metrics, the memory store, then the index
//! (loaded from its artifact pair, or built from the corpus when no pair
//! exists). The router only starts once the index is live, so no request
//! can observe a half-loaded index.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    config::Config,
    shared_state::{SharedState, UnifiedAppState},
};

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let request_timeout = cfg.upstream_timeout() * 2;
    let shared_state = Arc::new(SharedState::new(cfg)?);

    let index = shared_state
        .index
        .load_or_build(&shared_state.config.data_directory)
        .await?;
    info!("Vector index live with {} documents", index.len());

    let app = build_router(UnifiedAppState::new(shared_state), request_timeout);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

pub fn build_router(state: UnifiedAppState, request_timeout: Duration) -> Router {
    use crate::api;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(api::root))
        .route("/healthz", get(api::health))
        .route("/user-request", post(api::user_request))
        .route("/covid-consultation", post(api::covid_consultation))
        .route("/chat-history/:user_id", get(api::chat_history))
        .route("/store-message", post(api::store_message))
        .route("/profile/:user_id", get(api::user_profile))
        .route("/index/rebuild", post(api::rebuild_index))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
