//! Top-k retrieval with citation tokens.
//!
//! Results carry `K<n>` tokens numbered from a caller-supplied offset, so a
//! caller mixing knowledge base hits with other sources can keep every
//! token in a session distinct.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use knowledge_embeddings::EmbeddingModel;

use crate::error::KbError;
use crate::manager::KnowledgeBase;

/// Citation token `K<n>`, `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CitationToken(usize);

impl CitationToken {
    pub const PREFIX: char = 'K';

    pub fn new(number: usize) -> Self {
        Self(number)
    }

    pub fn number(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CitationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for CitationToken {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(Self)
            .ok_or_else(|| KbError::Config(format!("invalid citation token '{}'", s)))
    }
}

/// One search hit with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedRecord {
    pub citation: CitationToken,
    /// Inner product with the query, higher is closer
    pub score: f32,
    pub text: String,
    pub source_path: String,
    pub row_index: u64,
    pub metadata: BTreeMap<String, String>,
}

impl RetrievedRecord {
    pub fn source_name(&self) -> &str {
        std::path::Path::new(&self.source_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.source_path)
    }

    /// `"<file> row <n>"`
    pub fn location(&self) -> String {
        format!("{} row {}", self.source_name(), self.row_index)
    }

    /// `kb://<file>#R<n>`
    pub fn short_url(&self) -> String {
        format!("kb://{}#R{}", self.source_name(), self.row_index)
    }
}

/// Render hits as citation blocks for a prompt.
pub fn format_context(records: &[RetrievedRecord]) -> String {
    records
        .iter()
        .map(|r| {
            format!(
                "[{}] source: {}\nrow: {}\ncontent: {}",
                r.citation,
                r.source_name(),
                r.row_index,
                r.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// True when the caller got at least `min_hits` records.
pub fn meets_min_hits(records: &[RetrievedRecord], min_hits: usize) -> bool {
    records.len() >= min_hits
}

/// Searches one ready knowledge base.
///
/// The embedder must be the provider the index was built with.
#[derive(Clone)]
pub struct Retriever {
    kb: Arc<KnowledgeBase>,
    embedder: Arc<dyn EmbeddingModel>,
}

impl Retriever {
    pub fn new(kb: Arc<KnowledgeBase>, embedder: Arc<dyn EmbeddingModel>) -> Self {
        debug_assert_eq!(embedder.backend(), kb.manifest().embedding_backend);
        debug_assert_eq!(embedder.info().name, kb.manifest().embedding_model);
        Self { kb, embedder }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// Up to `top_k` records by descending score, cited `K<offset+1>..`.
    ///
    /// A blank query yields no records; an empty knowledge base is an error.
    pub fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        citation_offset: usize,
    ) -> Result<Vec<RetrievedRecord>, KbError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        if self.kb.is_empty() {
            return Err(KbError::EmptyIndex);
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query)?;
        let hits = self.kb.index().search(&embedding.values, top_k)?;

        let records: Vec<RetrievedRecord> = hits
            .into_iter()
            .enumerate()
            .filter_map(|(rank, hit)| {
                let doc = self.kb.document(hit.position)?;
                Some(RetrievedRecord {
                    citation: CitationToken::new(citation_offset + rank + 1),
                    score: hit.score,
                    text: doc.text.clone(),
                    source_path: doc.source_path.clone(),
                    row_index: doc.row_index,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect();

        debug!(top_k, hits = records.len(), offset = citation_offset, "Retrieved records");
        Ok(records)
    }
}

/// Running citation offset across several retrievals.
#[derive(Debug, Clone, Default)]
pub struct CitationSession {
    offset: usize,
}

impl CitationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after tokens already handed out elsewhere.
    pub fn starting_at(offset: usize) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn retrieve(
        &mut self,
        retriever: &Retriever,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedRecord>, KbError> {
        let records = retriever.retrieve(query, top_k, self.offset)?;
        self.offset += records.len();
        Ok(records)
    }
}
