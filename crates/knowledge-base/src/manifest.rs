//! Cache artifacts and their manifest.
//!
//! A cached knowledge base is two files in the cache directory:
//! - `<base>.vectors`: the binary [`FlatIndex`](knowledge_vector::FlatIndex) artifact
//! - `<base>.json`: a [`CacheSidecar`] holding the manifest and documents
//!
//! The sidecar is renamed into place last and records the checksum of the
//! vectors file, so a half-replaced pair never validates.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use knowledge_types::{DocumentRecord, EmbeddingBackend};

use crate::error::KbError;
use crate::fingerprint::{cache_base_name, Fingerprint};

/// Bumped whenever the artifact layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Identity and integrity record of a persisted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub format_version: u32,
    pub fingerprint: String,
    pub embedding_model: String,
    pub embedding_backend: EmbeddingBackend,
    pub dimension: usize,
    pub document_count: usize,
    /// Hex SHA-256 stored in the vectors artifact
    pub index_checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Why a cached manifest does not describe the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    FormatVersion { found: u32 },
    SourcesChanged,
    ModelChanged { cached: String, configured: String },
    BackendChanged { cached: EmbeddingBackend, configured: EmbeddingBackend },
    DimensionChanged { cached: usize, configured: usize },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::FormatVersion { found } => {
                write!(f, "format version {} (current {})", found, FORMAT_VERSION)
            }
            StaleReason::SourcesChanged => write!(f, "source files changed"),
            StaleReason::ModelChanged { cached, configured } => {
                write!(f, "embedding model changed from {} to {}", cached, configured)
            }
            StaleReason::BackendChanged { cached, configured } => {
                write!(f, "embedding backend changed from {} to {}", cached, configured)
            }
            StaleReason::DimensionChanged { cached, configured } => {
                write!(f, "embedding dimension changed from {} to {}", cached, configured)
            }
        }
    }
}

impl CacheManifest {
    /// Exact-match check against the current fingerprint and provider.
    ///
    /// `dimensions` is the configured output size; `None` accepts whatever
    /// the provider produced.
    pub fn check(
        &self,
        fingerprint: &Fingerprint,
        model: &str,
        backend: EmbeddingBackend,
        dimensions: Option<usize>,
    ) -> Result<(), StaleReason> {
        if self.format_version != FORMAT_VERSION {
            return Err(StaleReason::FormatVersion {
                found: self.format_version,
            });
        }
        if self.fingerprint != fingerprint.as_str() {
            return Err(StaleReason::SourcesChanged);
        }
        if self.embedding_model != model {
            return Err(StaleReason::ModelChanged {
                cached: self.embedding_model.clone(),
                configured: model.to_string(),
            });
        }
        if self.embedding_backend != backend {
            return Err(StaleReason::BackendChanged {
                cached: self.embedding_backend,
                configured: backend,
            });
        }
        match dimensions {
            Some(configured) if configured != self.dimension => {
                Err(StaleReason::DimensionChanged {
                    cached: self.dimension,
                    configured,
                })
            }
            _ => Ok(()),
        }
    }
}

/// JSON companion of the vectors file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSidecar {
    pub manifest: CacheManifest,
    /// Position `i` joins vector `i` of the index
    pub documents: Vec<DocumentRecord>,
}

impl CacheSidecar {
    pub fn read(path: &Path) -> Result<Self, KbError> {
        let bytes = std::fs::read(path)?;
        let sidecar: CacheSidecar = serde_json::from_slice(&bytes)
            .map_err(|e| KbError::CorruptIndex(format!("unreadable sidecar: {}", e)))?;
        if sidecar.documents.len() != sidecar.manifest.document_count {
            return Err(KbError::CorruptIndex(format!(
                "sidecar lists {} documents, manifest says {}",
                sidecar.documents.len(),
                sidecar.manifest.document_count
            )));
        }
        Ok(sidecar)
    }
}

/// Locations of the two artifacts for one source set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub dir: PathBuf,
    pub vectors: PathBuf,
    pub sidecar: PathBuf,
}

impl CachePaths {
    pub fn new<P: AsRef<Path>>(cache_dir: &Path, sources: &[P]) -> Self {
        let base = cache_base_name(sources);
        Self {
            dir: cache_dir.to_path_buf(),
            vectors: cache_dir.join(format!("{}.vectors", base)),
            sidecar: cache_dir.join(format!("{}.json", base)),
        }
    }

    /// Where the previous vectors file waits while a new one is renamed in.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.vectors.clone().into_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// True when either artifact is on disk.
    pub fn any_exists(&self) -> bool {
        self.vectors.exists() || self.sidecar.exists()
    }

    /// Delete both artifacts and any leftover backup; missing files are fine.
    pub fn remove(&self) -> Result<(), KbError> {
        for path in [&self.sidecar, &self.vectors, &self.backup_path()] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
