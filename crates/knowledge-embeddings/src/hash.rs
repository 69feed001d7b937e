//! Deterministic hashing embedder.
//!
//! Buckets lower-cased character trigrams with FNV-1a. Needs no model files
//! or network, so it backs offline smoke runs and tests. Similar strings
//! share trigrams and land close together, unrelated strings mostly do not.

use knowledge_types::EmbeddingBackend;

use crate::error::EmbeddingError;
use crate::model::{Embedding, EmbeddingModel, ModelInfo};

/// Model ids of the form `hash-<dimension>` select this embedder.
pub const HASH_MODEL_PREFIX: &str = "hash-";

pub const DEFAULT_HASH_DIMENSION: usize = 128;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    info: ModelInfo,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            info: ModelInfo {
                name: format!("{}{}", HASH_MODEL_PREFIX, dimension),
                dimension: Some(dimension),
                max_sequence_length: None,
            },
            dimension,
        }
    }

    /// Parse a `hash-<dimension>` model id.
    pub fn from_model_id(model: &str) -> Option<Result<Self, EmbeddingError>> {
        let suffix = model.strip_prefix(HASH_MODEL_PREFIX)?;
        Some(
            suffix
                .parse::<usize>()
                .ok()
                .filter(|d| *d > 0)
                .map(Self::new)
                .ok_or_else(|| {
                    EmbeddingError::Config(format!("invalid hash model id '{}'", model))
                }),
        )
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        if chars.is_empty() {
            return vector;
        }

        // Texts shorter than a trigram still get one bucket
        let windows: Vec<&[char]> = if chars.len() < 3 {
            vec![&chars[..]]
        } else {
            chars.windows(3).collect()
        };

        for window in windows {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }

        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMENSION)
    }
}

impl EmbeddingModel for HashEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn backend(&self) -> EmbeddingBackend {
        EmbeddingBackend::Local
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| Embedding::new(self.vectorize(text)))
            .collect())
    }
}
