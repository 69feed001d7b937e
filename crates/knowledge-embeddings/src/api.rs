//! Remote embedding provider for OpenAI-compatible `/embeddings` endpoints.
//!
//! Defaults target DashScope's compatible mode, which caps a request at
//! 10 inputs. Input is split into batches no larger than that cap and each
//! batch is retried a bounded number of times with exponential backoff.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use knowledge_types::{EmbeddingBackend, EmbeddingSettings};

use crate::error::EmbeddingError;
use crate::model::{check_dimensions, Embedding, EmbeddingModel, ModelInfo};

/// Configuration for the remote embedder.
#[derive(Debug, Clone)]
pub struct ApiEmbedderConfig {
    /// API base URL (e.g., "https://dashscope.aliyuncs.com/compatible-mode/v1")
    pub base_url: String,

    /// Model to use (e.g., "text-embedding-v3")
    pub model: String,

    /// API key; requests go out unauthenticated when absent
    pub api_key: Option<SecretString>,

    /// Requested texts per call
    pub batch_size: usize,

    /// Service-documented maximum texts per call
    pub max_batch_size: usize,

    /// Requested output dimension
    pub dimensions: Option<usize>,

    /// Request timeout
    pub timeout: Duration,

    /// Attempts per batch before failing
    pub max_retries: u32,

    /// First backoff interval
    pub retry_initial_interval: Duration,
}

impl ApiEmbedderConfig {
    /// Create config for a DashScope-compatible endpoint.
    pub fn dashscope(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let defaults = EmbeddingSettings::default();
        Self {
            base_url: defaults.api_base_url,
            model: model.into(),
            api_key: Some(SecretString::from(api_key.into())),
            batch_size: defaults.batch_size,
            max_batch_size: defaults.max_batch_size,
            dimensions: None,
            timeout: Duration::from_secs(defaults.request_timeout_secs),
            max_retries: defaults.max_retries,
            retry_initial_interval: Duration::from_millis(defaults.retry_initial_interval_ms),
        }
    }

    /// Build from knowledge base embedding settings.
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        Self {
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.resolved_api_key().map(SecretString::from),
            batch_size: settings.batch_size,
            max_batch_size: settings.max_batch_size,
            dimensions: settings.dimensions,
            timeout: Duration::from_secs(settings.request_timeout_secs),
            max_retries: settings.max_retries,
            retry_initial_interval: Duration::from_millis(settings.retry_initial_interval_ms),
        }
    }

    /// Batch size after clamping to the service limit.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, self.max_batch_size.max(1))
    }
}

/// Outcome of a single failed request.
enum RequestError {
    /// Worth another attempt (network, 429, 5xx, unreadable body)
    Transient(String),
    /// Retrying cannot help (auth, bad request)
    Permanent(String),
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Remote batch embedder.
pub struct ApiEmbedder {
    client: Client,
    config: ApiEmbedderConfig,
    info: ModelInfo,
}

impl ApiEmbedder {
    /// Create a new remote embedder.
    pub fn new(config: ApiEmbedderConfig) -> Result<Self, EmbeddingError> {
        if config.max_retries == 0 {
            return Err(EmbeddingError::Config("max_retries must be > 0".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;

        let info = ModelInfo {
            name: config.model.clone(),
            dimension: config.dimensions,
            max_sequence_length: None,
        };

        Ok(Self {
            client,
            config,
            info,
        })
    }

    pub fn config(&self) -> &ApiEmbedderConfig {
        &self.config
    }

    /// Embed one service-sized batch, retrying transient failures.
    fn call_with_retry(&self, batch: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_initial_interval)
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(attempt = attempts, size = batch.len(), "Calling embedding API");

            match self.make_request(batch) {
                Ok(embeddings) => return Ok(embeddings),
                Err(RequestError::Permanent(message)) => {
                    error!(error = %message, "Embedding request rejected");
                    return Err(EmbeddingError::Service { attempts, message });
                }
                Err(RequestError::Transient(message)) => {
                    if attempts >= self.config.max_retries {
                        error!(error = %message, attempts, "Max retries exceeded");
                        return Err(EmbeddingError::Service { attempts, message });
                    }

                    match backoff.next_backoff() {
                        Some(duration) => {
                            warn!(
                                error = %message,
                                retry_in_ms = duration.as_millis() as u64,
                                "Embedding call failed, retrying"
                            );
                            std::thread::sleep(duration);
                        }
                        None => {
                            error!(error = %message, "Backoff exhausted");
                            return Err(EmbeddingError::Service { attempts, message });
                        }
                    }
                }
            }
        }
    }

    /// Make a single API request.
    fn make_request(&self, batch: &[&str]) -> Result<Vec<Embedding>, RequestError> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: batch,
            encoding_format: "float",
            dimensions: self.config.dimensions,
        };

        let url = format!("{}/embeddings", self.config.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header(
                "Authorization",
                format!("Bearer {}", key.expose_secret()),
            );
        }

        let response = builder
            .send()
            .map_err(|e| RequestError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let message = format!("HTTP {}: {}", status, body);
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                Err(RequestError::Transient(message))
            } else {
                Err(RequestError::Permanent(message))
            };
        }

        let mut body: EmbeddingResponse = response
            .json()
            .map_err(|e| RequestError::Transient(format!("invalid response body: {}", e)))?;

        if body.data.len() != batch.len() {
            return Err(RequestError::Transient(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                body.data.len()
            )));
        }

        body.data.sort_by_key(|item| item.index);
        Ok(body
            .data
            .into_iter()
            .map(|item| Embedding::new(item.embedding))
            .collect())
    }
}

impl EmbeddingModel for ApiEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn backend(&self) -> EmbeddingBackend {
        EmbeddingBackend::Remote
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batch_size = self.config.effective_batch_size();
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            embeddings.extend(self.call_with_retry(batch)?);
        }

        check_dimensions(&embeddings, self.config.dimensions)?;
        debug!(count = embeddings.len(), "Remote batch complete");
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_clamped_to_service_limit() {
        let mut config = ApiEmbedderConfig::dashscope("key", "text-embedding-v3");
        config.batch_size = 25;
        assert_eq!(config.effective_batch_size(), 10);

        config.batch_size = 0;
        assert_eq!(config.effective_batch_size(), 1);

        config.batch_size = 4;
        let embedder = ApiEmbedder::new(config).unwrap();
        assert_eq!(embedder.max_batch_size(), 10);
    }

    #[test]
    fn test_from_settings_trims_base_url() {
        let settings = EmbeddingSettings {
            api_base_url: "http://localhost:8080/v1/".to_string(),
            api_key: Some("secret".to_string()),
            ..Default::default()
        };
        let config = ApiEmbedderConfig::from_settings(&settings);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.api_key.unwrap().expose_secret(), "secret");
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = ApiEmbedderConfig::dashscope("key", "text-embedding-v3");
        config.max_retries = 0;
        assert!(matches!(ApiEmbedder::new(config), Err(EmbeddingError::Config(_))));
    }

    #[test]
    fn test_request_serialization() {
        let input = ["a", "b"];
        let request = EmbeddingRequest {
            model: "text-embedding-v3",
            input: &input,
            encoding_format: "float",
            dimensions: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"], serde_json::json!(["a", "b"]));
        assert!(json.get("dimensions").is_none());
    }
}
