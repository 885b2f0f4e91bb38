//! In-process stand-ins for the embedding endpoint and the language model.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::context_engine::{AnswerGenerator, ProfileExtractor};
use crate::error::{ExtractionError, UpstreamError};
use crate::memory_db::ExtractedProfile;
use crate::vector_index::{Document, EmbeddingProvider};

pub fn fixture_corpus() -> Vec<Document> {
    ["fever and cough", "loss of smell", "headache and fatigue"]
        .iter()
        .enumerate()
        .map(|(i, text)| Document::new(*text, format!("fixture#{}", i)))
        .collect()
}

/// Hashes lowercased words into a fixed number of buckets and counts them.
/// Texts sharing words land close together; identical texts are identical.
pub struct BagOfWordsEmbedder {
    dimension: usize,
}

impl BagOfWordsEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = fnv1a(&word.to_lowercase()) as usize % self.dimension;
            vector[bucket] += 1.0;
        }
        vector
    }
}

fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

/// Fails the first `failures` batch calls with a transient error.
pub struct FlakyEmbedder {
    inner: BagOfWordsEmbedder,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(inner: BagOfWordsEmbedder, failures: usize) -> Self {
        Self { inner, failures, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(UpstreamError::transient("embeddings", "connection reset"));
        }
        self.inner.embed_batch(texts).await
    }
}

enum GeneratorMode {
    Echo,
    Failing(UpstreamError),
    Flaky(usize),
}

pub struct ScriptedGenerator {
    mode: GeneratorMode,
    calls: AtomicUsize,
    last_context: Mutex<Option<String>>,
}

impl ScriptedGenerator {
    fn with_mode(mode: GeneratorMode) -> Self {
        Self { mode, calls: AtomicUsize::new(0), last_context: Mutex::new(None) }
    }

    /// Answers `answer to: {question}`.
    pub fn echo() -> Self {
        Self::with_mode(GeneratorMode::Echo)
    }

    pub fn failing(error: UpstreamError) -> Self {
        Self::with_mode(GeneratorMode::Failing(error))
    }

    /// Fails `failures` times transiently, then echoes.
    pub fn flaky(failures: usize) -> Self {
        Self::with_mode(GeneratorMode::Flaky(failures))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedGenerator {
    async fn generate(&self, context: &str, question: &str) -> Result<String, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap() = Some(context.to_string());
        match &self.mode {
            GeneratorMode::Failing(error) => Err(error.clone()),
            GeneratorMode::Flaky(failures) if call < *failures => {
                Err(UpstreamError::transient("llm", "503 service unavailable"))
            }
            _ => Ok(format!("answer to: {}", question)),
        }
    }
}

pub enum ExtractorMode {
    Profile(ExtractedProfile),
    FormatError,
    Unavailable,
}

pub struct ScriptedExtractor {
    mode: ExtractorMode,
}

impl ScriptedExtractor {
    pub fn new(mode: ExtractorMode) -> Self {
        Self { mode }
    }

    pub fn empty() -> Self {
        Self::new(ExtractorMode::Profile(ExtractedProfile::default()))
    }
}

#[async_trait]
impl ProfileExtractor for ScriptedExtractor {
    async fn extract(&self, _message: &str) -> Result<ExtractedProfile, ExtractionError> {
        match &self.mode {
            ExtractorMode::Profile(profile) => Ok(profile.clone()),
            ExtractorMode::FormatError => Err(ExtractionError::Format("not json".to_string())),
            ExtractorMode::Unavailable => Err(UpstreamError::permanent("llm", "HTTP 401").into()),
        }
    }
}

/// A configuration pointing every path under `dir`; the URLs are never dialled.
pub fn test_config(dir: &std::path::Path) -> crate::config::Config {
    crate::config::Config {
        database_path: dir.join("consultations.db"),
        data_directory: dir.join("data"),
        index_directory: dir.join("Output"),
        llm_base_url: "http://127.0.0.1:9/v1".to_string(),
        llm_api_key: None,
        llm_model_name: "test-model".to_string(),
        llm_temperature: 0.7,
        embedding_base_url: "http://127.0.0.1:9".to_string(),
        embedding_api_key: None,
        embedding_model: "bag-of-words".to_string(),
        embedding_batch_size: 64,
        retrieval_top_k: 2,
        max_context_chars: 1000,
        retry_max_attempts: 1,
        retry_delay_ms: 1,
        retry_exponential: false,
        upstream_timeout_seconds: 5,
        max_concurrent_upstream: 2,
        api_host: "127.0.0.1".to_string(),
        api_port: 0,
        admin_token: Some("admin-secret".to_string()),
    }
}
