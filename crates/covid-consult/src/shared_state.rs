//! Shared application state
//!
//! Everything a request handler needs, wired once at startup and shared
//! behind `Arc`s. Handlers reach the store and the index only through the
//! orchestrator or these handles; nothing here is global.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::{
    config::Config,
    context_engine::{OrchestratorConfig, TurnOrchestrator},
    memory_db::MemoryDatabase,
    vector_index::{HttpEmbeddingProvider, IndexArtifacts, VectorIndexEngine},
    worker_threads::LLMWorker,
};

pub struct SharedState {
    pub config: Arc<Config>,
    pub database: Arc<MemoryDatabase>,
    pub index: Arc<VectorIndexEngine>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub started_at: Instant,
}

impl SharedState {
    /// Open the store and wire the index engine and the LLM worker. The index
    /// is not loaded here; callers decide between loading and building.
    pub fn new(config: Config) -> Result<Self> {
        let database = Arc::new(
            MemoryDatabase::new(&config.database_path)
                .with_context(|| format!("opening {}", config.database_path.display()))?,
        );
        info!("Memory database initialized at: {}", config.database_path.display());

        let index = Arc::new(build_index_engine(&config)?);

        let llm = Arc::new(
            LLMWorker::new(
                &config.llm_base_url,
                config.llm_model_name.clone(),
                config.upstream_timeout(),
                config.max_concurrent_upstream,
            )?
            .with_api_key(config.llm_api_key.clone())
            .with_temperature(config.llm_temperature),
        );

        let orchestrator = Arc::new(TurnOrchestrator::new(
            database.clone(),
            index.clone(),
            llm.clone(),
            llm,
            OrchestratorConfig {
                top_k: config.retrieval_top_k,
                max_context_chars: config.max_context_chars,
                retry: config.retry_policy(),
            },
        ));

        Ok(Self::from_parts(Arc::new(config), database, index, orchestrator))
    }

    pub fn from_parts(
        config: Arc<Config>,
        database: Arc<MemoryDatabase>,
        index: Arc<VectorIndexEngine>,
        orchestrator: Arc<TurnOrchestrator>,
    ) -> Self {
        Self { config, database, index, orchestrator, started_at: Instant::now() }
    }
}

/// The index engine alone, for the `build-index` command.
pub fn build_index_engine(config: &Config) -> Result<VectorIndexEngine> {
    let embedder = HttpEmbeddingProvider::new(
        &config.embedding_base_url,
        config.embedding_model.clone(),
        config.upstream_timeout(),
        config.max_concurrent_upstream,
    )?
    .with_api_key(config.embedding_api_key.clone());

    Ok(
        VectorIndexEngine::new(Arc::new(embedder), IndexArtifacts::in_dir(&config.index_directory))
            .with_retry(config.retry_policy())
            .with_batch_size(config.embedding_batch_size),
    )
}

/// Router state handed to every handler.
#[derive(Clone)]
pub struct UnifiedAppState {
    pub shared_state: Arc<SharedState>,
}

impl UnifiedAppState {
    pub fn new(shared_state: Arc<SharedState>) -> Self {
        Self { shared_state }
    }
}

impl std::ops::Deref for UnifiedAppState {
    type Target = SharedState;

    fn deref(&self) -> &Self::Target {
        &self.shared_state
    }
}
