//! Candle-based local embedding implementation.
//!
//! Runs a BERT sentence-transformer (all-MiniLM-L6-v2 by default) in-process
//! with mean pooling. Output dimension comes from the model's `hidden_size`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use knowledge_types::EmbeddingBackend;

use crate::cache::{read_hidden_size, ModelCache};
use crate::error::EmbeddingError;
use crate::model::{Embedding, EmbeddingModel, ModelInfo};

/// Maximum sequence length
pub const MAX_SEQ_LENGTH: usize = 256;

/// Texts per forward pass; bounds peak memory, not a service limit
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Candle-based embedder for BERT-family sentence-transformers.
pub struct CandleEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    info: ModelInfo,
    dimension: usize,
}

impl CandleEmbedder {
    /// Load the embedding model from cache (downloading if needed).
    pub fn load(cache: &ModelCache) -> Result<Self, EmbeddingError> {
        let paths = cache.get_or_download()?;
        Self::load_from_paths(
            &cache.model_id,
            &paths.config,
            &paths.tokenizer,
            &paths.weights,
        )
    }

    /// Load with default cache settings
    pub fn load_default() -> Result<Self, EmbeddingError> {
        let cache = ModelCache::default();
        Self::load(&cache)
    }

    /// Load from explicit file paths
    pub fn load_from_paths(
        name: &str,
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
    ) -> Result<Self, EmbeddingError> {
        info!(model = name, "Loading embedding model...");

        // CPU only for now
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(config_path)?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| EmbeddingError::ModelNotFound(format!("Invalid config: {}", e)))?;
        let dimension = read_hidden_size(&config_str)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, &device)?
        };

        let model = BertModel::load(vb, &config)?;

        info!(dim = dimension, max_seq = MAX_SEQ_LENGTH, "Model loaded successfully");

        Ok(Self {
            model,
            tokenizer,
            device,
            info: ModelInfo {
                name: name.to_string(),
                dimension: Some(dimension),
                max_sequence_length: Some(MAX_SEQ_LENGTH),
            },
            dimension,
        })
    }

    /// Mean pooling over token embeddings (excluding padding)
    fn mean_pooling(
        &self,
        embeddings: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor, EmbeddingError> {
        let mask = attention_mask
            .unsqueeze(2)?
            .broadcast_as(embeddings.shape())?;
        let mask_f32 = mask.to_dtype(DType::F32)?;

        let masked = embeddings.broadcast_mul(&mask_f32)?;
        let sum = masked.sum(1)?;

        let mask_sum = mask_f32.sum(1)?;
        let mask_sum = mask_sum.clamp(1e-9, f64::MAX)?;

        let mean = sum.broadcast_div(&mask_sum)?;
        Ok(mean)
    }

    /// One forward pass over at most `DEFAULT_BATCH_SIZE` texts.
    fn forward_chunk(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .min(MAX_SEQ_LENGTH);

        let mut input_ids: Vec<Vec<u32>> = Vec::with_capacity(encodings.len());
        let mut attention_masks: Vec<Vec<u32>> = Vec::with_capacity(encodings.len());

        for encoding in &encodings {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();

            let truncated_len = ids.len().min(max_len);
            let mut padded_ids = ids[..truncated_len].to_vec();
            let mut padded_mask = mask[..truncated_len].to_vec();

            padded_ids.resize(max_len, 0);
            padded_mask.resize(max_len, 0);

            input_ids.push(padded_ids);
            attention_masks.push(padded_mask);
        }

        let batch_size = texts.len();
        let input_ids_flat: Vec<u32> = input_ids.into_iter().flatten().collect();
        let mask_flat: Vec<u32> = attention_masks.into_iter().flatten().collect();

        let input_ids = Tensor::from_vec(input_ids_flat, (batch_size, max_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask_flat, (batch_size, max_len), &self.device)?;
        let token_type_ids = Tensor::zeros_like(&input_ids)?;

        let output = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let pooled = self.mean_pooling(&output, &attention_mask)?;
        let pooled_vec: Vec<Vec<f32>> = pooled.to_vec2()?;

        Ok(pooled_vec.into_iter().map(Embedding::new).collect())
    }
}

impl EmbeddingModel for CandleEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn backend(&self) -> EmbeddingBackend {
        EmbeddingBackend::Local
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!(count = texts.len(), "Embedding batch");

        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(DEFAULT_BATCH_SIZE) {
            embeddings.extend(self.forward_chunk(chunk)?);
        }

        debug!(count = embeddings.len(), dim = self.dimension, "Batch complete");

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_size_parsing() {
        assert_eq!(read_hidden_size(r#"{"hidden_size": 384}"#).unwrap(), 384);
        assert!(read_hidden_size(r#"{"vocab_size": 10}"#).is_err());
        assert!(read_hidden_size("not json").is_err());
    }

    // Tests below need the model download; run with `-- --ignored`.

    #[test]
    #[ignore = "requires model download"]
    fn test_load_model() {
        let embedder = CandleEmbedder::load_default().unwrap();
        assert_eq!(embedder.info().dimension, Some(384));
        assert_eq!(embedder.backend(), EmbeddingBackend::Local);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_embed_batch_larger_than_chunk() {
        let embedder = CandleEmbedder::load_default().unwrap();
        let texts: Vec<String> = (0..40).map(|i| format!("row {}", i)).collect();
        let embeddings = embedder.embed_texts(&texts).unwrap();
        assert_eq!(embeddings.len(), 40);
        for emb in &embeddings {
            assert_eq!(emb.dimension(), 384);
        }
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_similar_texts_high_similarity() {
        let embedder = CandleEmbedder::load_default().unwrap();
        let emb1 = embedder.embed("name: Kweichow Moutai | industry: liquor").unwrap();
        let emb2 = embedder.embed("Moutai is a liquor company").unwrap();
        let emb3 = embedder.embed("Python programming language").unwrap();

        assert!(emb1.cosine_similarity(&emb2) > emb1.cosine_similarity(&emb3));
    }
}
