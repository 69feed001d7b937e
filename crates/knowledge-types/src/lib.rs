//! # knowledge-types
//!
//! Shared domain types for the tabular knowledge base.
//!
//! This crate defines the data structures passed between the loader,
//! the embedding providers, the vector store and the cache manager:
//! - Source files: `(path, size, mtime)` descriptors used for fingerprinting
//! - Document records: one normalized text row plus provenance
//! - Settings: layered configuration for the whole subsystem

pub mod config;
pub mod error;
pub mod record;

pub use config::{expand_path, EmbeddingBackend, EmbeddingSettings, Settings};
pub use error::TypesError;
pub use record::{DocumentRecord, SourceFile};
