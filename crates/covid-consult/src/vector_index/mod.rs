//! Exact nearest-neighbor retrieval over the consultation corpus.

pub mod artifacts;
pub mod corpus;
pub mod embeddings;
pub mod engine;
pub mod flat_index;

pub use artifacts::{ArtifactState, IndexArtifacts};
pub use corpus::{load_corpus, QaPair};
pub use embeddings::{EmbeddingProvider, HttpEmbeddingProvider};
pub use engine::{IndexStats, VectorIndexEngine};
pub use flat_index::{Document, FlatIndex, SearchHit};
