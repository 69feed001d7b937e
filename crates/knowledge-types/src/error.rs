//! Error types shared across the knowledge base crates.

use thiserror::Error;

/// Errors raised while loading or validating shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
