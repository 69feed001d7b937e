//! Embedding error types.

use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Remote service still failing after bounded retries
    #[error("Embedding service failed after {attempts} attempt(s): {message}")]
    Service { attempts: u32, message: String },

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(String),

    /// Candle model error
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Model file not found
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    /// Download error
    #[error("Failed to download model: {0}")]
    Download(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Provider configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EmbeddingError {
    /// True when the remote service exhausted its retries.
    pub fn is_service_failure(&self) -> bool {
        matches!(self, EmbeddingError::Service { .. })
    }
}
