//! # knowledge-vector
//!
//! Exact nearest-neighbour index for the tabular knowledge base.
//!
//! Row counts are in the low thousands, so a flat row-major matrix with a
//! linear inner-product scan is fast enough and gives exact, reproducible
//! rankings. Vectors are expected to be unit length, making the inner product
//! a cosine similarity.
//!
//! ## Features
//! - Deterministic ordering: score descending, ties by ascending position
//! - Checksummed little-endian binary artifact (`save` / `load`)
//! - Positions are the join key with the caller's document list

pub mod error;
pub mod flat;
pub mod index;

pub use error::VectorError;
pub use flat::{FlatIndex, FORMAT_VERSION, MAGIC};
pub use index::{IndexStats, SearchResult};
