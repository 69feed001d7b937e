//! Configuration loading for the knowledge base.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/knowledge-base/config.toml.
//! Environment variables use the `KB_` prefix and `__` for nesting, e.g.
//! `KB_EMBEDDING__MODEL=text-embedding-v3` or `KB_SOURCES=a.xlsx,b.csv`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Which embedding implementation backs a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Remote batch embedding service (OpenAI-compatible endpoint)
    #[default]
    #[serde(alias = "dashscope", alias = "api")]
    Remote,
    /// In-process model, no network access during embedding
    Local,
}

impl EmbeddingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingBackend::Remote => "remote",
            EmbeddingBackend::Local => "local",
        }
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingBackend {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "dashscope" | "api" => Ok(EmbeddingBackend::Remote),
            "local" => Ok(EmbeddingBackend::Local),
            other => Err(TypesError::InvalidInput(format!(
                "unknown embedding backend '{}' (expected remote or local)",
                other
            ))),
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    /// Model identifier (remote model name, or HuggingFace repo id with an
    /// optional `@revision`)
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Texts per embedding request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Remote service limit per request; local backends ignore it
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Base URL of the OpenAI-compatible embedding endpoint
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// API key (prefer env vars over config files)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Requested output dimension, when the service supports choosing one
    #[serde(default)]
    pub dimensions: Option<usize>,

    /// Attempts per batch before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff interval between attempts (ms)
    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,

    /// Per-request HTTP timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Where local model files are cached
    #[serde(default)]
    pub model_cache_dir: Option<String>,
}

fn default_embedding_model() -> String {
    "text-embedding-v3".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    10
}

fn default_api_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_interval_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_embedding_model(),
            batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            api_base_url: default_api_base_url(),
            api_key: None,
            dimensions: None,
            max_retries: default_max_retries(),
            retry_initial_interval_ms: default_retry_initial_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            model_cache_dir: None,
        }
    }
}

impl EmbeddingSettings {
    /// API key from settings, falling back to `DASHSCOPE_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("DASHSCOPE_API_KEY").ok())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("embedding.model must not be empty".to_string());
        }
        if self.batch_size == 0 {
            return Err("embedding.batch_size must be > 0".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("embedding.max_batch_size must be > 0".to_string());
        }
        if self.max_retries == 0 {
            return Err("embedding.max_retries must be > 0".to_string());
        }
        if self.dimensions == Some(0) {
            return Err("embedding.dimensions must be > 0 when set".to_string());
        }
        Ok(())
    }
}

/// Main knowledge base settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Ordered source files; entries may hold comma-separated lists
    #[serde(default)]
    pub sources: Vec<String>,

    /// Directory relative source paths are resolved against (default: cwd)
    #[serde(default)]
    pub base_dir: Option<String>,

    /// Directory holding cached index artifacts
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Records returned per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum hits the caller expects before trusting the knowledge base
    #[serde(default = "default_min_hits")]
    pub min_hits: usize,

    /// Abandon a rebuild after this many seconds
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

fn default_cache_dir() -> String {
    ProjectDirs::from("", "", "knowledge-base")
        .map(|p| p.cache_dir().join("index"))
        .unwrap_or_else(|| PathBuf::from(".kb_cache"))
        .to_string_lossy()
        .to_string()
}

fn default_top_k() -> usize {
    3
}

fn default_min_hits() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            base_dir: None,
            cache_dir: default_cache_dir(),
            top_k: default_top_k(),
            min_hits: default_min_hits(),
            build_timeout_secs: None,
            log_level: default_log_level(),
            embedding: EmbeddingSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/knowledge-base/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (KB_*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "knowledge-base")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("cache_dir", default_cache_dir())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("top_k", default_top_k() as i64)
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("min_hits", default_min_hits() as i64)
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("embedding.backend", EmbeddingBackend::default().as_str())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("embedding.model", default_embedding_model())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("KB")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sources")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate().map_err(TypesError::Config)?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.top_k == 0 {
            return Err("top_k must be > 0".to_string());
        }
        if self.cache_dir.trim().is_empty() {
            return Err("cache_dir must not be empty".to_string());
        }
        if self.build_timeout_secs == Some(0) {
            return Err("build_timeout_secs must be > 0 when set".to_string());
        }
        self.embedding.validate()
    }

    /// Cache directory with `~` expanded.
    pub fn expanded_cache_dir(&self) -> PathBuf {
        expand_path(&self.cache_dir)
    }

    /// Base directory for relative sources, defaulting to the working directory.
    pub fn expanded_base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => expand_path(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Expand `~` and environment references in a user-supplied path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
}
