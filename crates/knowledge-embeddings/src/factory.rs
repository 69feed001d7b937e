//! Provider selection from configuration.

use std::sync::Arc;

use tracing::info;

use knowledge_types::{EmbeddingBackend, EmbeddingSettings};

use crate::api::{ApiEmbedder, ApiEmbedderConfig};
use crate::cache::ModelCache;
use crate::candle::CandleEmbedder;
use crate::error::EmbeddingError;
use crate::hash::HashEmbedder;
use crate::model::EmbeddingModel;

/// Builds embedding providers for a configuration.
///
/// The cache manager holds one factory and asks it for a provider at most
/// once per backend/model pair.
pub trait EmbedderFactory: Send + Sync {
    fn create(&self, settings: &EmbeddingSettings)
        -> Result<Arc<dyn EmbeddingModel>, EmbeddingError>;
}

/// Remote settings map to [`ApiEmbedder`]; local settings map to
/// [`HashEmbedder`] for `hash-<dim>` ids and [`CandleEmbedder`] otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEmbedderFactory;

impl EmbedderFactory for DefaultEmbedderFactory {
    fn create(
        &self,
        settings: &EmbeddingSettings,
    ) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        match settings.backend {
            EmbeddingBackend::Remote => {
                info!(model = %settings.model, url = %settings.api_base_url, "Using remote embeddings");
                let embedder = ApiEmbedder::new(ApiEmbedderConfig::from_settings(settings))?;
                Ok(Arc::new(embedder))
            }
            EmbeddingBackend::Local => {
                if let Some(hash) = HashEmbedder::from_model_id(&settings.model) {
                    info!(model = %settings.model, "Using hashing embeddings");
                    return Ok(Arc::new(hash?));
                }
                let cache = ModelCache::from_settings(settings);
                info!(model = %settings.model, "Using local Candle embeddings");
                Ok(Arc::new(CandleEmbedder::load(&cache)?))
            }
        }
    }
}
