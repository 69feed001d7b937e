//! Vector index error types.

use thiserror::Error;

/// Errors that can occur during vector operations.
#[derive(Debug, Error)]
pub enum VectorError {
    /// Search against an index holding no vectors
    #[error("Index is empty")]
    EmptyIndex,

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted artifact failed validation
    #[error("Corrupt index: {0}")]
    Corrupt(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
