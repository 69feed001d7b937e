//! # knowledge-base
//!
//! Tabular knowledge base with a fingerprinted on-disk index cache.
//!
//! Rows from CSV/TSV and spreadsheet files become [`DocumentRecord`]s, are
//! embedded once, and land in an exact inner-product [`FlatIndex`]. The
//! index and documents are persisted next to a [`CacheManifest`] so later
//! processes can reuse them until a source file, the embedding model or the
//! backend changes.
//!
//! ## Components
//! - [`fingerprint`]: content identity of the source set
//! - [`loader`]: tabular file parsing
//! - [`manifest`]: cache artifact layout and validation
//! - [`manager`]: `Unloaded -> Validating -> Fresh | Rebuilding -> Ready`
//! - [`retriever`]: top-k search with `K<n>` citation tokens
//!
//! ## Usage
//! ```ignore
//! let manager = KnowledgeBaseManager::new();
//! let config = KnowledgeBaseConfig::from_settings(&settings);
//! let retriever = manager.retriever(&config)?;
//! let hits = retriever.retrieve("lithium battery suppliers", 3, 0)?;
//! ```

pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod retriever;

pub use error::KbError;
pub use fingerprint::{cache_base_name, describe_sources, fingerprint_sources, Fingerprint};
pub use loader::{load_all, load_documents, resolve_source_paths, SourceFormat};
pub use manager::{
    BuildDeadline, CacheState, CacheStatus, KnowledgeBase, KnowledgeBaseConfig,
    KnowledgeBaseManager, LoadOrigin,
};
pub use manifest::{CacheManifest, CachePaths, CacheSidecar, StaleReason, FORMAT_VERSION};
pub use retriever::{
    format_context, meets_min_hits, CitationSession, CitationToken, RetrievedRecord, Retriever,
};

pub use knowledge_types::{DocumentRecord, SourceFile};
pub use knowledge_vector::FlatIndex;
