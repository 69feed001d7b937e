//! Knowledge base error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use knowledge_embeddings::EmbeddingError;
use knowledge_vector::VectorError;

/// Errors surfaced by loading, building and querying a knowledge base.
///
/// Callers treat every variant as "knowledge base unavailable" and carry on
/// without it. [`KbError::is_retryable`] tells whether a later attempt with
/// the same configuration may succeed.
#[derive(Debug, Error)]
pub enum KbError {
    /// Source file missing or unreadable
    #[error("Source unavailable: {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    /// Source file could not be parsed
    #[error("Malformed source {}: {reason}", path.display())]
    MalformedSource { path: PathBuf, reason: String },

    /// Embedding provider failed (remote retries exhausted, model load, ...)
    #[error("Embedding service error: {0}")]
    EmbeddingService(#[from] EmbeddingError),

    /// Persisted index failed validation
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Search against a knowledge base with no records
    #[error("Knowledge base is empty")]
    EmptyIndex,

    /// Rebuild ran past its deadline
    #[error("Knowledge base build exceeded {timeout:?}")]
    BuildTimeout { timeout: Duration },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other vector index error
    #[error("Vector index error: {0}")]
    Vector(VectorError),
}

impl From<VectorError> for KbError {
    fn from(err: VectorError) -> Self {
        match err {
            VectorError::EmptyIndex => KbError::EmptyIndex,
            VectorError::Corrupt(reason) => KbError::CorruptIndex(reason),
            other => KbError::Vector(other),
        }
    }
}

impl KbError {
    /// True when retrying the same configuration later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            KbError::SourceUnavailable { .. }
            | KbError::BuildTimeout { .. }
            | KbError::Io(_)
            | KbError::CorruptIndex(_) => true,
            KbError::EmbeddingService(e) => e.is_service_failure(),
            KbError::MalformedSource { .. }
            | KbError::EmptyIndex
            | KbError::Serialization(_)
            | KbError::Config(_)
            | KbError::Vector(_) => false,
        }
    }
}
