//! Embedding model trait and types.
//!
//! Defines the interface for generating vector embeddings from text.

use knowledge_types::EmbeddingBackend;

use crate::error::EmbeddingError;

/// Vector embedding - a normalized float array.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector (normalized to unit length)
    pub values: Vec<f32>,
}

impl Embedding {
    /// Create a new embedding from a vector.
    /// Normalizes the vector to unit length.
    pub fn new(values: Vec<f32>) -> Self {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let normalized = if norm > 0.0 {
            values.iter().map(|x| x / norm).collect()
        } else {
            values
        };
        Self { values: normalized }
    }

    /// Create embedding without normalization (for pre-normalized vectors)
    pub fn from_normalized(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Get the embedding dimension
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity with another embedding.
    /// Returns value in [-1, 1] range (1 = identical).
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        // Both are normalized, so the dot product is the cosine
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Model identifier (e.g., "text-embedding-v3", "sentence-transformers/all-MiniLM-L6-v2")
    pub name: String,
    /// Embedding dimension, when known before the first call
    pub dimension: Option<usize>,
    /// Maximum sequence length in tokens, when the model exposes one
    pub max_sequence_length: Option<usize>,
}

/// Trait for embedding models.
///
/// Implementations must be thread-safe (Send + Sync) for concurrent use and
/// must return unit-length vectors.
pub trait EmbeddingModel: Send + Sync {
    /// Get model information
    fn info(&self) -> &ModelInfo;

    /// Which backend this model runs on
    fn backend(&self) -> EmbeddingBackend;

    /// Largest number of texts accepted per provider call
    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    /// Generate embeddings for multiple texts, same order as the input.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError>;

    /// Generate embedding for a single text.
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidInput("provider returned no embedding".to_string()))
    }

    /// Generate embeddings for multiple owned strings.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        self.embed_batch(&refs)
    }
}

/// Check that every embedding shares one dimension (and the expected one, if given).
///
/// Returns the common dimension, or `None` for an empty slice.
pub fn check_dimensions(
    embeddings: &[Embedding],
    expected: Option<usize>,
) -> Result<Option<usize>, EmbeddingError> {
    let Some(first) = embeddings.first() else {
        return Ok(expected);
    };
    let dimension = expected.unwrap_or(first.dimension());
    for embedding in embeddings {
        if embedding.dimension() != dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: embedding.dimension(),
            });
        }
    }
    Ok(Some(dimension))
}
