//! Shared fixtures for knowledge base integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use knowledge_base::KnowledgeBaseConfig;
use knowledge_embeddings::{
    EmbedderFactory, Embedding, EmbeddingError, EmbeddingModel, HashEmbedder, ModelInfo,
};
use knowledge_types::{EmbeddingBackend, EmbeddingSettings};

pub const MODEL: &str = "hash-64";

#[derive(Debug, Default)]
pub struct Stats {
    pub created: AtomicUsize,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

impl Stats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

/// Hashing embedder that counts calls and can be slowed down or broken.
pub struct CountingEmbedder {
    inner: HashEmbedder,
    stats: Arc<Stats>,
    delay: Duration,
    fail: bool,
    max_batch: Option<usize>,
}

impl EmbeddingModel for CountingEmbedder {
    fn info(&self) -> &ModelInfo {
        self.inner.info()
    }

    fn backend(&self) -> EmbeddingBackend {
        EmbeddingBackend::Local
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch.unwrap_or(usize::MAX)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.max_batch {
            assert!(texts.len() <= max, "batch of {} over limit {}", texts.len(), max);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(EmbeddingError::Service {
                attempts: 3,
                message: "HTTP 500 Internal Server Error".to_string(),
            });
        }
        self.stats.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }
}

#[derive(Default)]
pub struct CountingFactory {
    pub stats: Arc<Stats>,
    pub delay: Duration,
    pub fail: bool,
    pub max_batch: Option<usize>,
}

impl CountingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn capped(max_batch: usize) -> Arc<Self> {
        Arc::new(Self {
            max_batch: Some(max_batch),
            ..Default::default()
        })
    }
}

impl EmbedderFactory for CountingFactory {
    fn create(
        &self,
        settings: &EmbeddingSettings,
    ) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        let inner = HashEmbedder::from_model_id(&settings.model)
            .ok_or_else(|| EmbeddingError::Config(format!("not a hash model: {}", settings.model)))??;
        Ok(Arc::new(CountingEmbedder {
            inner,
            stats: Arc::clone(&self.stats),
            delay: self.delay,
            fail: self.fail,
            max_batch: self.max_batch,
        }))
    }
}

pub fn local_settings(model: &str) -> EmbeddingSettings {
    EmbeddingSettings {
        backend: EmbeddingBackend::Local,
        model: model.to_string(),
        batch_size: 2,
        ..Default::default()
    }
}

pub fn config(sources: Vec<PathBuf>, cache_dir: &Path) -> KnowledgeBaseConfig {
    KnowledgeBaseConfig::new(sources, cache_dir).with_embedding(local_settings(MODEL))
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Two sources with 3 and 4 valid rows; each file also has a blank row.
pub fn seven_row_sources(dir: &Path) -> Vec<PathBuf> {
    let companies = write_file(
        dir,
        "companies.csv",
        "name,industry,city\n\
         Kweichow Moutai,liquor,Renhuai\n\
         ,,\n\
         CATL,lithium batteries,Ningde\n\
         BYD,electric vehicles,Shenzhen\n",
    );
    let concepts = write_file(
        dir,
        "concepts.tsv",
        "concept\tleader\n\
         solid-state battery\tCATL\n\
         baijiu\tMoutai\n\
         \t\n\
         photovoltaic\tLONGi\n\
         semiconductor equipment\tNAURA\n",
    );
    vec![companies, concepts]
}

/// One CSV source with `rows` data rows.
pub fn numbered_source(dir: &Path, rows: usize) -> PathBuf {
    let mut contents = String::from("ticker,name\n");
    for i in 0..rows {
        contents.push_str(&format!("{:06},company {}\n", i, i));
    }
    write_file(dir, "numbered.csv", &contents)
}

/// Names and contents of every file in `dir`, sorted by name.
pub fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            files.insert(name, std::fs::read(entry.path()).unwrap());
        }
    }
    files
}
