//! Search result and statistics types.

/// Result of a vector search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    /// Ordinal position of the vector (join key into the document list)
    pub position: usize,
    /// Inner product with the query; cosine similarity for unit vectors
    pub score: f32,
}

impl SearchResult {
    pub fn new(position: usize, score: f32) -> Self {
        Self { position, score }
    }
}

/// Index statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of vectors in the index
    pub vector_count: usize,
    /// Embedding dimension
    pub dimension: usize,
    /// Size of the serialized artifact in bytes
    pub size_bytes: u64,
}
