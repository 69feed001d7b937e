//! Flat exact-search index.
//!
//! Artifact layout (all integers little-endian):
//!
//! ```text
//! magic "KBVI" | version u32 | dimension u32 | count u64 | count*dimension f32 | sha256(previous bytes)
//! ```

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::VectorError;
use crate::index::{IndexStats, SearchResult};

/// Artifact magic bytes
pub const MAGIC: &[u8; 4] = b"KBVI";

/// Artifact format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const CHECKSUM_LEN: usize = 32;

/// Row-major matrix of unit vectors searched by linear scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Empty index of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Build an index from `vectors`, in order. Position `i` is `vectors[i]`.
    pub fn build<V: AsRef<[f32]>>(dimension: usize, vectors: &[V]) -> Result<Self, VectorError> {
        let mut index = Self::new(dimension);
        index.rebuild(vectors)?;
        Ok(index)
    }

    /// Replace the contents of the index. O(N·D).
    ///
    /// On error the previous contents are kept.
    pub fn rebuild<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> Result<(), VectorError> {
        let mut data = Vec::with_capacity(vectors.len() * self.dimension);
        for vector in vectors {
            let vector = vector.as_ref();
            if vector.len() != self.dimension {
                return Err(VectorError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            data.extend_from_slice(vector);
        }
        self.data = data;
        debug!(count = self.len(), dim = self.dimension, "Built flat index");
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dimension;
        Some(&self.data[start..start + self.dimension])
    }

    /// Top `k` positions by inner product with `query`.
    ///
    /// Ordered by score descending, ties by ascending position. `k` is
    /// clamped to the number of stored vectors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorError> {
        if self.is_empty() {
            return Err(VectorError::EmptyIndex);
        }
        if query.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut results: Vec<SearchResult> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| SearchResult::new(position, dot(row, query)))
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        });
        results.truncate(k.min(self.len()));

        debug!(k = k, found = results.len(), "Search complete");
        Ok(results)
    }

    /// Serialize to the checksummed binary artifact.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4 + CHECKSUM_LEN);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);
        bytes
    }

    /// Parse and validate a binary artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VectorError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(VectorError::Corrupt(format!(
                "artifact too short ({} bytes)",
                bytes.len()
            )));
        }

        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(VectorError::Corrupt("checksum mismatch".to_string()));
        }

        if &body[0..4] != MAGIC {
            return Err(VectorError::Corrupt("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(read_array(&body[4..8]));
        if version != FORMAT_VERSION {
            return Err(VectorError::Corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }
        let dimension = u32::from_le_bytes(read_array(&body[8..12])) as usize;
        let count = u64::from_le_bytes(read_array(&body[12..20])) as usize;

        let payload = &body[HEADER_LEN..];
        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| VectorError::Corrupt("header overflow".to_string()))?;
        if payload.len() != expected_len {
            return Err(VectorError::Corrupt(format!(
                "expected {} payload bytes for {} x {}, found {}",
                expected_len,
                count,
                dimension,
                payload.len()
            )));
        }
        if dimension == 0 && count > 0 {
            return Err(VectorError::Corrupt("vectors with zero dimension".to_string()));
        }

        let data = payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(read_array(chunk)))
            .collect();

        Ok(Self { dimension, data })
    }

    /// Hex SHA-256 checksum as embedded in the artifact.
    pub fn checksum(&self) -> String {
        let bytes = self.to_bytes();
        hex::encode(&bytes[bytes.len() - CHECKSUM_LEN..])
    }

    /// Write the artifact to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VectorError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes())?;
        info!(path = ?path, vectors = self.len(), "Saved vector index");
        Ok(())
    }

    /// Read and validate the artifact at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VectorError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Load and require a specific dimension.
    pub fn load_expecting(path: impl AsRef<Path>, dimension: usize) -> Result<Self, VectorError> {
        let index = Self::load(path)?;
        if index.dimension != dimension {
            return Err(VectorError::Corrupt(format!(
                "dimension {} does not match expected {}",
                index.dimension, dimension
            )));
        }
        Ok(index)
    }

    /// Get index statistics
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vector_count: self.len(),
            dimension: self.dimension,
            size_bytes: (HEADER_LEN + self.data.len() * 4 + CHECKSUM_LEN) as u64,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}
