//! Vector index engine: builds a [`FlatIndex`] from a corpus, persists it as
//! an artifact pair, and serves k-NN queries.
//!
//! The published index sits behind an [`ArcSwapOption`]. Queries take one
//! snapshot and never observe a half-built index; a rebuild prepares the new
//! index completely, persists it, and only then swaps it in.

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IndexError, UpstreamError};
use crate::retry::RetryPolicy;
use crate::vector_index::artifacts::{ArtifactState, IndexArtifacts};
use crate::vector_index::corpus::load_corpus;
use crate::vector_index::embeddings::EmbeddingProvider;
use crate::vector_index::flat_index::{Document, FlatIndex, SearchHit};

const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub loaded: bool,
    pub documents: usize,
    pub dimension: usize,
    pub embedding_model: String,
    pub vectors_path: PathBuf,
    pub metadata_path: PathBuf,
}

pub struct VectorIndexEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    artifacts: IndexArtifacts,
    retry: RetryPolicy,
    batch_size: usize,
    current: ArcSwapOption<FlatIndex>,
    /// Serializes builds; queries never take it.
    build_lock: Mutex<()>,
}

impl VectorIndexEngine {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, artifacts: IndexArtifacts) -> Self {
        Self {
            embedder,
            artifacts,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            current: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn artifacts(&self) -> &IndexArtifacts {
        &self.artifacts
    }

    /// The currently published index, if any.
    pub fn snapshot(&self) -> Option<Arc<FlatIndex>> {
        self.current.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    /// Embed `texts` in batches, preserving order. Each batch goes through
    /// the retry policy on its own.
    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (n, batch) in texts.chunks(self.batch_size).enumerate() {
            let embedder = &self.embedder;
            let embedded = self
                .retry
                .run("embed", move || async move { embedder.embed_batch(batch).await })
                .await?;
            if embedded.len() != batch.len() {
                return Err(UpstreamError::permanent(
                    "embeddings",
                    format!("batch {}: expected {} vectors, got {}", n, batch.len(), embedded.len()),
                )
                .into());
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Embed the corpus, persist it, then publish it. A build that fails to
    /// persist is discarded and the previous index stays live.
    pub async fn build(&self, corpus: Vec<Document>) -> Result<Arc<FlatIndex>, IndexError> {
        if corpus.is_empty() {
            return Err(IndexError::EmptyCorpus);
        }
        let _guard = self.build_lock.lock().await;
        let started = Instant::now();
        info!("Building index over {} documents with {}", corpus.len(), self.embedder.model_name());

        let texts: Vec<String> = corpus.iter().map(|d| d.text.clone()).collect();
        let vectors = self.encode(&texts).await?;

        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(UpstreamError::permanent("embeddings", "provider returned empty vectors").into());
        }
        let mut index = FlatIndex::new(dimension);
        for (document, vector) in corpus.into_iter().zip(vectors.iter()) {
            index.push(document, vector)?;
        }
        let index = Arc::new(index);

        let artifacts = self.artifacts.clone();
        let to_persist = Arc::clone(&index);
        tokio::task::spawn_blocking(move || artifacts.persist(&to_persist))
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;

        self.current.store(Some(Arc::clone(&index)));
        info!(
            "Index published: {} documents, dimension {} ({:?})",
            index.len(),
            dimension,
            started.elapsed()
        );
        Ok(index)
    }

    /// Write the published index to an artifact pair under `dir`.
    pub async fn persist_to(&self, dir: &Path) -> Result<(), IndexError> {
        let index = self.snapshot().ok_or(IndexError::NotLoaded)?;
        let artifacts = IndexArtifacts::in_dir(dir);
        tokio::task::spawn_blocking(move || artifacts.persist(&index))
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e)))?
    }

    /// Load the artifact pair under `dir` and publish it.
    pub async fn load_from(&self, dir: &Path) -> Result<Arc<FlatIndex>, IndexError> {
        self.load_artifacts(IndexArtifacts::in_dir(dir)).await
    }

    /// Load the engine's own artifact pair and publish it.
    pub async fn load(&self) -> Result<Arc<FlatIndex>, IndexError> {
        self.load_artifacts(self.artifacts.clone()).await
    }

    async fn load_artifacts(&self, artifacts: IndexArtifacts) -> Result<Arc<FlatIndex>, IndexError> {
        let index = tokio::task::spawn_blocking(move || artifacts.load())
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;
        let index = Arc::new(index);
        self.current.store(Some(Arc::clone(&index)));
        info!("Index loaded: {} documents, dimension {}", index.len(), index.dimension());
        Ok(index)
    }

    /// Reuse the persisted pair when present, otherwise build from the
    /// corpus directory. A half-present pair is reported as corrupt.
    pub async fn load_or_build(&self, corpus_dir: &Path) -> Result<Arc<FlatIndex>, IndexError> {
        match self.artifacts.state() {
            ArtifactState::Missing => {
                info!("No index artifacts found, building from {}", corpus_dir.display());
                let corpus = load_corpus(corpus_dir)?;
                self.build(corpus).await
            }
            ArtifactState::Partial => {
                warn!("Index artifact pair under {} is incomplete", self.artifacts.vectors_path.display());
                self.load().await
            }
            ArtifactState::Present => self.load().await,
        }
    }

    /// The `k` nearest documents to `text`, nearest first.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>, IndexError> {
        Ok(self
            .query_hits(text, k)
            .await?
            .into_iter()
            .map(|hit| hit.document)
            .collect())
    }

    pub async fn query_hits(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidK);
        }
        let index = self.snapshot().ok_or(IndexError::NotLoaded)?;

        let embedder = &self.embedder;
        let query = self
            .retry
            .run("embed-query", move || async move { embedder.embed(text).await })
            .await?;

        let hits = index.search(&query, k)?;
        debug!("Query matched {} of {} documents (k={})", hits.len(), index.len(), k);
        Ok(hits)
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            loaded: snapshot.is_some(),
            documents: snapshot.as_ref().map(|i| i.len()).unwrap_or(0),
            dimension: snapshot.as_ref().map(|i| i.dimension()).unwrap_or(0),
            embedding_model: self.embedder.model_name().to_string(),
            vectors_path: self.artifacts.vectors_path.clone(),
            metadata_path: self.artifacts.metadata_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::test_support::{fixture_corpus, BagOfWordsEmbedder, FlakyEmbedder};
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine_in(dir: &TempDir) -> VectorIndexEngine {
        VectorIndexEngine::new(
            Arc::new(BagOfWordsEmbedder::new(64)),
            IndexArtifacts::in_dir(dir.path()),
        )
    }

    fn texts(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_fever_query_finds_fever_document() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        engine.build(fixture_corpus()).await.unwrap();

        let docs = engine.query("I have a fever", 1).await.unwrap();
        assert_eq!(texts(&docs), vec!["fever and cough"]);
    }

    #[tokio::test]
    async fn test_own_text_is_first_hit() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        engine.build(fixture_corpus()).await.unwrap();

        for doc in fixture_corpus() {
            let hits = engine.query_hits(&doc.text, 2).await.unwrap();
            assert_eq!(hits[0].document, doc);
            assert_eq!(hits[0].distance, 0.0);
        }
    }

    #[tokio::test]
    async fn test_k_beyond_corpus_returns_all() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        engine.build(fixture_corpus()).await.unwrap();
        assert_eq!(engine.query("cough", 50).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_zero_k_rejected_before_anything_else() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        // Not loaded yet, but k is validated first.
        assert!(matches!(engine.query("cough", 0).await, Err(IndexError::InvalidK)));
    }

    #[tokio::test]
    async fn test_query_before_load_fails() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        assert!(matches!(engine.query("cough", 1).await, Err(IndexError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_empty_corpus_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        assert!(matches!(engine.build(Vec::new()).await, Err(IndexError::EmptyCorpus)));
        assert_eq!(engine.artifacts().state(), ArtifactState::Missing);
    }

    #[tokio::test]
    async fn test_build_persists_and_reload_matches() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        engine.build(fixture_corpus()).await.unwrap();
        let before = engine.query("smell and cough", 3).await.unwrap();

        let reloaded = engine_in(&dir);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.query("smell and cough", 3).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_persist_to_and_load_from_other_directory() {
        let dir = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        engine.build(fixture_corpus()).await.unwrap();
        engine.persist_to(backup.path()).await.unwrap();

        let other = engine_in(&TempDir::new().unwrap());
        other.load_from(backup.path()).await.unwrap();
        assert_eq!(other.stats().documents, 3);
    }

    #[tokio::test]
    async fn test_load_or_build_builds_from_corpus_dir_once() {
        let index_dir = TempDir::new().unwrap();
        let corpus_dir = TempDir::new().unwrap();
        std::fs::write(
            corpus_dir.path().join("qa.json"),
            r#"[{"user":"Do I have a fever?","assistant":"Measure your temperature."}]"#,
        )
        .unwrap();

        let engine = engine_in(&index_dir);
        engine.load_or_build(corpus_dir.path()).await.unwrap();
        assert_eq!(engine.artifacts().state(), ArtifactState::Present);

        // Second start reuses the artifacts even if the corpus disappears.
        std::fs::remove_file(corpus_dir.path().join("qa.json")).unwrap();
        let restarted = engine_in(&index_dir);
        let index = restarted.load_or_build(corpus_dir.path()).await.unwrap();
        assert_eq!(index.documents()[0].source, "qa.json#0");
    }

    #[tokio::test]
    async fn test_load_or_build_refuses_partial_pair() {
        let index_dir = TempDir::new().unwrap();
        let corpus_dir = TempDir::new().unwrap();
        let engine = engine_in(&index_dir);
        engine.build(fixture_corpus()).await.unwrap();
        std::fs::remove_file(&engine.artifacts().metadata_path).unwrap();

        let restarted = engine_in(&index_dir);
        assert!(matches!(
            restarted.load_or_build(corpus_dir.path()).await,
            Err(IndexError::Corrupt(_))
        ));
        assert!(!restarted.is_loaded());
    }

    #[tokio::test]
    async fn test_transient_embedding_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyEmbedder::new(BagOfWordsEmbedder::new(64), 2));
        let engine = VectorIndexEngine::new(flaky.clone(), IndexArtifacts::in_dir(dir.path()))
            .with_retry(RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1))));

        engine.build(fixture_corpus()).await.unwrap();
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_upstream_error() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyEmbedder::new(BagOfWordsEmbedder::new(64), 10));
        let engine = VectorIndexEngine::new(flaky, IndexArtifacts::in_dir(dir.path()))
            .with_retry(RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(1))));

        assert!(matches!(engine.build(fixture_corpus()).await, Err(IndexError::Upstream(_))));
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_small_batches_preserve_order() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir).with_batch_size(1);
        let index = engine.build(fixture_corpus()).await.unwrap();
        assert_eq!(index.documents(), fixture_corpus().as_slice());
        assert_eq!(engine.query("loss of smell", 1).await.unwrap()[0].text, "loss of smell");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rebuild_never_mixes_old_and_new_documents() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine_in(&dir));
        let old: Vec<Document> = (0..20)
            .map(|i| Document::new(format!("old fever note {}", i), "old"))
            .collect();
        let new: Vec<Document> = (0..20)
            .map(|i| Document::new(format!("new fever note {}", i), "new"))
            .collect();
        engine.build(old).await.unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let docs = engine.query("fever note", 10).await.unwrap();
                        let first = docs[0].source.clone();
                        assert!(docs.iter().all(|d| d.source == first));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        engine.build(new).await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert!(engine.query("fever", 1).await.unwrap()[0].source == "new");
    }

    #[tokio::test]
    async fn test_stats_reflect_published_index() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        assert!(!engine.stats().loaded);

        engine.build(fixture_corpus()).await.unwrap();
        let stats = engine.stats();
        assert!(stats.loaded);
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.dimension, 64);
        assert_eq!(stats.embedding_model, "bag-of-words");
    }
}
