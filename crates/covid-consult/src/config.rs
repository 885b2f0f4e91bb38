// covid-consult/crates/covid-consult/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub data_directory: PathBuf,
    pub index_directory: PathBuf,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model_name: String,
    pub llm_temperature: f32,
    pub embedding_base_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub retrieval_top_k: usize,
    pub max_context_chars: usize,
    pub retry_max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_exponential: bool,
    pub upstream_timeout_seconds: u64,
    pub max_concurrent_upstream: usize,
    pub api_host: String,
    pub api_port: u16,
    /// Bearer token for `POST /index/rebuild`; the route is refused when unset.
    pub admin_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let data_directory = PathBuf::from(env_or("DATA_DIRECTORY", "./data"));
        // Index artifacts default to a sibling `Output` directory of the data directory.
        let index_directory = env::var("INDEX_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                data_directory
                    .parent()
                    .map(|p| p.join("Output"))
                    .unwrap_or_else(|| PathBuf::from("./Output"))
            });

        let llm_base_url = env_or("LLM_BASE_URL", "https://openrouter.ai/api/v1");
        let llm_api_key = env::var("LLM_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        if llm_api_key.is_none() {
            warn!("LLM_API_KEY not set; requests to {} will be unauthenticated", llm_base_url);
        }

        let embedding_base_url = env_or("EMBEDDING_BASE_URL", "http://127.0.0.1:8081");
        let embedding_api_key = env::var("EMBEDDING_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|k| !k.trim().is_empty());

        let retry_exponential = match env_or("RETRY_BACKOFF", "fixed").to_lowercase().as_str() {
            "fixed" => false,
            "exponential" => true,
            other => {
                return Err(anyhow::anyhow!(
                    "RETRY_BACKOFF must be 'fixed' or 'exponential', got '{}'",
                    other
                ))
            }
        };

        let config = Self {
            database_path: PathBuf::from(env_or("DATABASE_PATH", "./data/consultations.db")),
            data_directory,
            index_directory,
            llm_base_url,
            llm_api_key,
            llm_model_name: env_or("LLM_MODEL_NAME", "openai/gpt-4o-mini"),
            llm_temperature: parse_env("LLM_TEMPERATURE", "0.7")?,
            embedding_base_url,
            embedding_api_key,
            embedding_model: env_or("EMBEDDING_MODEL", "all-MiniLM-L6-v2"),
            embedding_batch_size: parse_env("EMBEDDING_BATCH_SIZE", "64")?,
            retrieval_top_k: parse_env("RETRIEVAL_TOP_K", "5")?,
            max_context_chars: parse_env("MAX_CONTEXT_CHARS", "12000")?,
            retry_max_attempts: parse_env("RETRY_MAX_ATTEMPTS", "10")?,
            retry_delay_ms: parse_env("RETRY_DELAY_MS", "1000")?,
            retry_exponential,
            upstream_timeout_seconds: parse_env("UPSTREAM_TIMEOUT_SECONDS", "60")?,
            max_concurrent_upstream: parse_env("MAX_CONCURRENT_UPSTREAM", "4")?,
            api_host: env_or("API_HOST", "127.0.0.1"),
            api_port: parse_env("API_PORT", "8000")?,
            admin_token,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retrieval_top_k == 0 {
            return Err(anyhow::anyhow!("RETRIEVAL_TOP_K must be at least 1"));
        }
        if self.embedding_batch_size == 0 {
            return Err(anyhow::anyhow!("EMBEDDING_BATCH_SIZE must be at least 1"));
        }
        if self.max_concurrent_upstream == 0 {
            return Err(anyhow::anyhow!("MAX_CONCURRENT_UPSTREAM must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(anyhow::anyhow!(
                "LLM_TEMPERATURE must be within 0.0..=2.0, got {}",
                self.llm_temperature
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        let backoff = if self.retry_exponential {
            Backoff::Exponential(delay)
        } else {
            Backoff::Fixed(delay)
        };
        RetryPolicy::new(self.retry_max_attempts, backoff)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Data Directory: {}", self.data_directory.display());
        info!("- Index Directory: {}", self.index_directory.display());
        info!("- LLM: {} ({})", self.llm_model_name, self.llm_base_url);
        info!("- LLM API Key: {}", mask(self.llm_api_key.as_deref()));
        info!("- Embeddings: {} ({})", self.embedding_model, self.embedding_base_url);
        info!("- Embedding Batch Size: {}", self.embedding_batch_size);
        info!("- Retrieval Top-K: {}", self.retrieval_top_k);
        info!(
            "- Retry: {} attempts, {}ms {}",
            self.retry_max_attempts,
            self.retry_delay_ms,
            if self.retry_exponential { "exponential" } else { "fixed" }
        );
        info!("- Upstream Timeout: {}s", self.upstream_timeout_seconds);
        info!("- Max Concurrent Upstream Calls: {}", self.max_concurrent_upstream);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Admin Token: {}", mask(self.admin_token.as_deref()));
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env_or(key, default);
    raw.trim()
        .parse()
        .with_context(|| format!("{} has an invalid value '{}'", key, raw))
}

fn mask(secret: Option<&str>) -> &'static str {
    match secret {
        Some(_) => "<set>",
        None => "<unset>",
    }
}
