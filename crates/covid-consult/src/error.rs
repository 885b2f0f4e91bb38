// covid-consult/crates/covid-consult/src/error.rs

//! Error types for the retrieval engine, the memory store and the turn
//! orchestrator.
//!
//! Variants are grouped the way callers react to them: input errors are
//! surfaced verbatim, integrity errors are fatal to the component instance,
//! upstream errors go through the retry policy.

use std::path::PathBuf;
use thiserror::Error;

/// Anything that can be retried by [`crate::retry::RetryPolicy`].
pub trait Transient {
    fn is_transient(&self) -> bool;
}

// ── Upstream collaborators ─────────────────────────────────────────────────

/// Failure reported by an external collaborator (embedding endpoint,
/// answer generator, extractor).
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("{service} timed out after {seconds}s")]
    Timeout { service: String, seconds: u64 },

    /// Connection failures, HTTP 429 and 5xx.
    #[error("{service} transient failure: {message}")]
    Transient { service: String, message: String },

    /// Everything the upstream will keep rejecting: 4xx, bad payloads.
    #[error("{service} failed: {message}")]
    Permanent { service: String, message: String },
}

impl UpstreamError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient { service: service.into(), message: message.into() }
    }

    pub fn permanent(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent { service: service.into(), message: message.into() }
    }

    /// Classify a reqwest error; anything at the transport level is worth
    /// another attempt.
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(service, err.to_string())
        } else if err.status().map(|s| is_retryable_status(s.as_u16())).unwrap_or(false) {
            Self::transient(service, err.to_string())
        } else {
            Self::permanent(service, err.to_string())
        }
    }

    /// Classify a non-success HTTP status returned by an upstream.
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        if is_retryable_status(status) {
            Self::transient(service, message)
        } else {
            Self::permanent(service, message)
        }
    }
}

impl Transient for UpstreamError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }
}

/// HTTP statuses an upstream is expected to recover from.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Vector index ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cannot build an index over an empty corpus")]
    EmptyCorpus,

    #[error("k must be at least 1")]
    InvalidK,

    #[error("no index has been built or loaded")]
    NotLoaded,

    #[error("no index artifacts found under {0}")]
    NotFound(PathBuf),

    /// The artifact pair on disk cannot be trusted; rebuild or restore a
    /// known-good pair.
    #[error("index artifacts are corrupt: {0}")]
    Corrupt(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("corpus error in {path}: {message}")]
    Corpus { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Transient for IndexError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(e) if e.is_transient())
    }
}

// ── Graph memory store ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username '{0}' already exists")]
    DuplicateUsername(String),

    #[error("unknown user id '{0}'")]
    UnknownUser(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    /// Never carries the attempted password.
    #[error("incorrect password")]
    BadCredential,

    #[error("invalid message role '{0}' (expected 'user' or 'assistant')")]
    InvalidRole(String),

    #[error("password hashing failed: {0}")]
    Credential(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored data is malformed: {0}")]
    Malformed(String),

    #[error("store worker failed: {0}")]
    Worker(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            // r2d2 only fails `get` on checkout timeout.
            Self::Pool(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// ── Structured extraction ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction output is not a profile object: {0}")]
    Format(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl Transient for ExtractionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(e) if e.is_transient())
    }
}

// ── Conversational turn ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    /// Retries exhausted or a permanent upstream failure.
    #[error("upstream failure: {0}")]
    UpstreamFailure(UpstreamError),

    #[error("no chat history found for user '{0}'")]
    NoHistory(String),
}

impl From<UpstreamError> for TurnError {
    fn from(e: UpstreamError) -> Self {
        Self::UpstreamFailure(e)
    }
}
