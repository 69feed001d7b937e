//! # knowledge-embeddings
//!
//! Embedding providers for the tabular knowledge base.
//!
//! Every provider implements [`EmbeddingModel`] and returns L2-normalized
//! vectors, so inner-product search downstream is cosine similarity.
//!
//! ## Providers
//! - [`ApiEmbedder`]: remote OpenAI-compatible batch endpoint with bounded
//!   retries and exponential backoff
//! - [`CandleEmbedder`]: local BERT sentence-transformer via Candle, works
//!   offline once model files are cached
//! - [`HashEmbedder`]: deterministic trigram hashing, no model files at all
//!
//! [`DefaultEmbedderFactory`] picks the provider from
//! [`knowledge_types::EmbeddingSettings`].

pub mod api;
pub mod cache;
pub mod candle;
pub mod error;
pub mod factory;
pub mod hash;
pub mod model;

pub use crate::candle::CandleEmbedder;
pub use api::{ApiEmbedder, ApiEmbedderConfig};
pub use cache::{
    read_hidden_size, split_model_id, ModelCache, ModelPaths, DEFAULT_MODEL_REPO, DEFAULT_REVISION,
    MODEL_FILES,
};
pub use error::EmbeddingError;
pub use factory::{DefaultEmbedderFactory, EmbedderFactory};
pub use hash::HashEmbedder;
pub use knowledge_types::EmbeddingBackend;
pub use model::{Embedding, EmbeddingModel, ModelInfo};
