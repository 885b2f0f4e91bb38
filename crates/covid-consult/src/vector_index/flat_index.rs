//! Exhaustive L2 nearest-neighbor index.
//!
//! Vectors and their documents live in one structure and are only ever
//! appended together, so row `i` of the matrix always belongs to
//! `documents[i]`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::IndexError;

/// Rows below this are scanned on the calling thread.
const PARALLEL_SCAN_THRESHOLD: usize = 2048;

/// Retrievable text plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub source: String,
}

impl Document {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self { text: text.into(), source: source.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Insertion position of the document in the index.
    pub position: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    /// Row-major `len() x dimension` matrix.
    vectors: Vec<f32>,
    documents: Vec<Document>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, vectors: Vec::new(), documents: Vec::new() }
    }

    /// Reassemble an index from a flat matrix and its documents, checking
    /// that both describe the same number of rows.
    pub fn from_parts(
        dimension: usize,
        vectors: Vec<f32>,
        documents: Vec<Document>,
    ) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::Corrupt("vector dimension is zero".to_string()));
        }
        let expected = dimension.checked_mul(documents.len()).ok_or_else(|| {
            IndexError::Corrupt(format!(
                "{} vectors of dimension {} overflow the address space",
                documents.len(),
                dimension
            ))
        })?;
        if vectors.len() != expected {
            return Err(IndexError::Corrupt(format!(
                "{} floats cannot hold {} vectors of dimension {}",
                vectors.len(),
                documents.len(),
                dimension
            )));
        }
        Ok(Self { dimension, vectors, documents })
    }

    pub fn push(&mut self, document: Document, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        self.vectors.extend_from_slice(embedding);
        self.documents.push(document);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.vectors.get(start..end)
    }

    /// The `k` nearest documents, nearest first. Equal distances keep
    /// insertion order. Returns every document when the index holds fewer
    /// than `k`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidK);
        }
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let distances: Vec<f32> = if self.len() >= PARALLEL_SCAN_THRESHOLD {
            self.vectors
                .par_chunks_exact(self.dimension)
                .map(|row| l2_squared(query, row))
                .collect()
        } else {
            self.vectors
                .chunks_exact(self.dimension)
                .map(|row| l2_squared(query, row))
                .collect()
        };

        let by_distance = |a: &usize, b: &usize| -> Ordering {
            distances[*a].total_cmp(&distances[*b]).then(a.cmp(b))
        };

        let mut order: Vec<usize> = (0..distances.len()).collect();
        let k = k.min(order.len());
        if k < order.len() {
            order.select_nth_unstable_by(k - 1, by_distance);
            order.truncate(k);
        }
        order.sort_by(by_distance);

        Ok(order
            .into_iter()
            .map(|position| SearchHit {
                position,
                distance: distances[position],
                document: self.documents[position].clone(),
            })
            .collect())
    }
}

pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
