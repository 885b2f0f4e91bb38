//! Embedding provider contract and the OpenAI-compatible `/v1/embeddings`
//! client used in production (llama-server, text-embeddings-inference,
//! OpenAI itself).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::UpstreamError;

const SERVICE: &str = "embeddings";

/// Maps text to fixed-dimension vectors. Implementations must preserve input
/// order and return exactly one vector per input.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| UpstreamError::permanent(SERVICE, "empty embedding response"))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

pub(crate) fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/embeddings") {
        return normalized.to_string();
    }
    if has_version_suffix(normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

impl HttpEmbeddingProvider {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::permanent(SERVICE, format!("cannot build HTTP client: {}", e)))?;
        let endpoint = embeddings_endpoint(base_url);
        debug!("Embedding provider endpoint: {}", endpoint);
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            api_key: None,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        let request = EmbeddingRequest { model: &self.model, input: texts };
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::permanent(SERVICE, format!("invalid response body: {}", e)))?;

        let mut data = parsed.data;
        // Servers are allowed to return items out of order when they carry an index.
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        if data.len() != texts.len() {
            return Err(UpstreamError::permanent(
                SERVICE,
                format!("expected {} embeddings, got {}", texts.len(), data.len()),
            ));
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::permanent(SERVICE, "embedding client shut down"))?;

        debug!("Embedding {} text(s) with {}", texts.len(), self.model);
        match tokio::time::timeout(self.timeout, self.request(texts)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                service: SERVICE.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}
