//! Knowledge base cache manager.
//!
//! Per configuration the manager walks
//! `Unloaded -> Validating -> (Fresh | Rebuilding) -> Ready`:
//! - Validating fingerprints the sources and reads the cached artifacts
//! - Fresh means the manifest matches exactly and the index checks out;
//!   neither the loader nor the embedder is touched
//! - Rebuilding loads, embeds and indexes every row, then swaps the new
//!   artifacts into place
//!
//! Any failure returns the slot to `Unloaded` and leaves the cache directory
//! as it was. At most one thread builds a given configuration; the others
//! wait and receive the same [`KnowledgeBase`].
//!
//! The one exception is a crash between the two renames at the end of a
//! rebuild: the new vectors file then sits next to the old sidecar. The
//! sidecar's checksum rejects that pair and the next run rebuilds.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use knowledge_embeddings::model::check_dimensions;
use knowledge_embeddings::{
    DefaultEmbedderFactory, EmbedderFactory, Embedding, EmbeddingError, EmbeddingModel,
};
use knowledge_types::{DocumentRecord, EmbeddingBackend, EmbeddingSettings, Settings};
use knowledge_vector::FlatIndex;

use crate::error::KbError;
use crate::fingerprint::{describe_sources, display_paths, Fingerprint};
use crate::loader::{load_all, resolve_source_paths};
use crate::manifest::{CacheManifest, CachePaths, CacheSidecar, StaleReason, FORMAT_VERSION};
use crate::retriever::Retriever;

/// Everything that identifies one knowledge base.
#[derive(Debug, Clone)]
pub struct KnowledgeBaseConfig {
    /// Ordered source files
    pub sources: Vec<PathBuf>,
    pub embedding: EmbeddingSettings,
    pub cache_dir: PathBuf,
    /// Abandon a rebuild after this long
    pub build_timeout: Option<Duration>,
}

impl KnowledgeBaseConfig {
    pub fn new(sources: Vec<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            embedding: EmbeddingSettings::default(),
            cache_dir: cache_dir.into(),
            build_timeout: None,
        }
    }

    pub fn with_embedding(mut self, embedding: EmbeddingSettings) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }

    /// Resolve sources and directories from layered settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sources: resolve_source_paths(&settings.sources, &settings.expanded_base_dir()),
            embedding: settings.embedding.clone(),
            cache_dir: settings.expanded_cache_dir(),
            build_timeout: settings.build_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Identity of this configuration within a manager.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.cache_dir.display(),
            self.embedding.backend,
            self.embedding.model,
            self.embedding
                .dimensions
                .map(|d| d.to_string())
                .unwrap_or_default(),
            self.embedding.api_base_url,
            display_paths(&self.sources)
        )
    }

    pub fn cache_paths(&self) -> CachePaths {
        CachePaths::new(&self.cache_dir, &self.sources)
    }
}

/// Lifecycle state of one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheState {
    #[default]
    Unloaded,
    Validating,
    Fresh,
    Rebuilding,
    Ready,
}

/// How a ready knowledge base came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    /// Loaded from a valid cache
    Fresh,
    /// Built from the sources
    Rebuilt,
}

/// On-disk cache condition, reported without building.
#[derive(Debug, Clone)]
pub enum CacheStatus {
    Missing,
    Fresh(CacheManifest),
    Stale {
        manifest: CacheManifest,
        reason: StaleReason,
    },
    Corrupt(String),
}

/// Cooperative time limit for a rebuild.
///
/// Checked between stages and between embedding batches; a provider call
/// already in flight runs to completion.
#[derive(Debug, Clone, Copy)]
pub struct BuildDeadline {
    started: Instant,
    timeout: Option<Duration>,
}

impl BuildDeadline {
    pub fn start(timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.timeout.is_some_and(|t| self.elapsed() >= t)
    }

    pub fn check(&self) -> Result<(), KbError> {
        match self.timeout {
            Some(timeout) if self.elapsed() >= timeout => Err(KbError::BuildTimeout { timeout }),
            _ => Ok(()),
        }
    }
}

/// A loaded, immutable knowledge base.
#[derive(Debug)]
pub struct KnowledgeBase {
    documents: Vec<DocumentRecord>,
    index: FlatIndex,
    manifest: CacheManifest,
    origin: LoadOrigin,
    cache_dir: PathBuf,
}

impl KnowledgeBase {
    pub fn documents(&self) -> &[DocumentRecord] {
        &self.documents
    }

    pub fn document(&self, position: usize) -> Option<&DocumentRecord> {
        self.documents.get(position)
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    pub fn origin(&self) -> LoadOrigin {
        self.origin
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[derive(Default)]
struct SlotStatus {
    state: CacheState,
    ready: Option<Arc<KnowledgeBase>>,
}

/// Per-configuration build lock plus published state.
#[derive(Default)]
struct Slot {
    build: Mutex<()>,
    status: RwLock<SlotStatus>,
}

impl Slot {
    fn ready(&self) -> Option<Arc<KnowledgeBase>> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
            .clone()
    }

    fn state(&self) -> CacheState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    fn set_state(&self, state: CacheState) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    fn publish(&self, state: CacheState, ready: Option<Arc<KnowledgeBase>>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.state = state;
        status.ready = ready;
    }
}

enum CacheCheck {
    Missing,
    Stale {
        manifest: CacheManifest,
        reason: StaleReason,
    },
    Corrupt(String),
    Fresh {
        sidecar: CacheSidecar,
        index: FlatIndex,
    },
}

/// Backend, model, requested dimension and endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmbedderKey {
    backend: EmbeddingBackend,
    model: String,
    dimensions: Option<usize>,
    api_base_url: String,
}

impl EmbedderKey {
    fn new(settings: &EmbeddingSettings) -> Self {
        Self {
            backend: settings.backend,
            model: settings.model.clone(),
            dimensions: settings.dimensions,
            api_base_url: settings.api_base_url.clone(),
        }
    }
}

/// Provider for one key, created at most once.
type EmbedderSlot = Mutex<Option<Arc<dyn EmbeddingModel>>>;

/// Owns every knowledge base and embedding provider of a process.
pub struct KnowledgeBaseManager {
    factory: Arc<dyn EmbedderFactory>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    embedders: Mutex<HashMap<EmbedderKey, Arc<EmbedderSlot>>>,
}

impl Default for KnowledgeBaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBaseManager {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultEmbedderFactory))
    }

    pub fn with_factory(factory: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            embedders: Mutex::new(HashMap::new()),
        }
    }

    /// Return the ready knowledge base for `config`, loading or building it.
    pub fn ensure_ready(&self, config: &KnowledgeBaseConfig) -> Result<Arc<KnowledgeBase>, KbError> {
        let slot = self.slot(config);
        if let Some(kb) = slot.ready() {
            return Ok(kb);
        }

        let _build = lock(&slot.build);
        // Another caller may have finished while we waited
        if let Some(kb) = slot.ready() {
            return Ok(kb);
        }

        match self.load_or_rebuild(config, &slot) {
            Ok(kb) => {
                let kb = Arc::new(kb);
                slot.publish(CacheState::Ready, Some(Arc::clone(&kb)));
                Ok(kb)
            }
            Err(e) => {
                warn!(error = %e, sources = %display_paths(&config.sources), "Knowledge base unavailable");
                slot.publish(CacheState::Unloaded, None);
                Err(e)
            }
        }
    }

    /// Ready knowledge base paired with its embedding provider.
    pub fn retriever(&self, config: &KnowledgeBaseConfig) -> Result<Retriever, KbError> {
        let kb = self.ensure_ready(config)?;
        let embedder = self.embedder(config)?;
        Ok(Retriever::new(kb, embedder))
    }

    /// Shared provider for the configured backend, model, dimension and endpoint.
    ///
    /// Created on first use and reused for every later build and query.
    /// Creating one (a model download for local backends) only blocks
    /// callers asking for the same provider.
    pub fn embedder(
        &self,
        config: &KnowledgeBaseConfig,
    ) -> Result<Arc<dyn EmbeddingModel>, KbError> {
        let slot = {
            let mut embedders = lock(&self.embedders);
            Arc::clone(embedders.entry(EmbedderKey::new(&config.embedding)).or_default())
        };

        let mut provider = lock(slot.as_ref());
        if let Some(embedder) = provider.as_ref() {
            return Ok(Arc::clone(embedder));
        }
        let embedder = self.factory.create(&config.embedding)?;
        *provider = Some(Arc::clone(&embedder));
        Ok(embedder)
    }

    /// Current lifecycle state; never blocks on a running build.
    pub fn state(&self, config: &KnowledgeBaseConfig) -> CacheState {
        let slot = lock(&self.slots).get(&config.key()).cloned();
        slot.map(|s| s.state()).unwrap_or_default()
    }

    /// Validate the on-disk cache without loading or building.
    pub fn inspect(&self, config: &KnowledgeBaseConfig) -> Result<CacheStatus, KbError> {
        let sources = describe_sources(&config.sources)?;
        let fingerprint = Fingerprint::compute(&sources);
        let status = match check_cache(&config.cache_paths(), &fingerprint, &config.embedding) {
            CacheCheck::Missing => CacheStatus::Missing,
            CacheCheck::Stale { manifest, reason } => CacheStatus::Stale { manifest, reason },
            CacheCheck::Corrupt(reason) => CacheStatus::Corrupt(reason),
            CacheCheck::Fresh { sidecar, .. } => CacheStatus::Fresh(sidecar.manifest),
        };
        Ok(status)
    }

    /// Forget the in-memory knowledge base; with `purge`, delete its artifacts too.
    ///
    /// Waits for a running build of the same configuration to finish.
    pub fn invalidate(&self, config: &KnowledgeBaseConfig, purge: bool) -> Result<(), KbError> {
        let slot = lock(&self.slots).get(&config.key()).cloned();
        let _build = slot.as_ref().map(|s| lock(&s.build));
        if let Some(slot) = &slot {
            slot.publish(CacheState::Unloaded, None);
        }
        if purge {
            config.cache_paths().remove()?;
        }
        info!(sources = %display_paths(&config.sources), purge, "Invalidated knowledge base");
        Ok(())
    }

    fn slot(&self, config: &KnowledgeBaseConfig) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(config.key()).or_default())
    }

    fn load_or_rebuild(
        &self,
        config: &KnowledgeBaseConfig,
        slot: &Slot,
    ) -> Result<KnowledgeBase, KbError> {
        slot.set_state(CacheState::Validating);
        let sources = describe_sources(&config.sources)?;
        let fingerprint = Fingerprint::compute(&sources);
        let paths = config.cache_paths();

        match check_cache(&paths, &fingerprint, &config.embedding) {
            CacheCheck::Fresh { sidecar, index } => {
                slot.set_state(CacheState::Fresh);
                info!(
                    documents = sidecar.documents.len(),
                    path = %paths.sidecar.display(),
                    "Loaded knowledge base from cache"
                );
                return Ok(KnowledgeBase {
                    documents: sidecar.documents,
                    index,
                    manifest: sidecar.manifest,
                    origin: LoadOrigin::Fresh,
                    cache_dir: paths.dir,
                });
            }
            CacheCheck::Missing => info!("No cached index, building"),
            CacheCheck::Stale { reason, .. } => info!(reason = %reason, "Cached index is stale, rebuilding"),
            CacheCheck::Corrupt(reason) => warn!(reason = %reason, "Cached index is corrupt, rebuilding"),
        }

        slot.set_state(CacheState::Rebuilding);
        self.rebuild(config, &paths, fingerprint)
    }

    fn rebuild(
        &self,
        config: &KnowledgeBaseConfig,
        paths: &CachePaths,
        fingerprint: Fingerprint,
    ) -> Result<KnowledgeBase, KbError> {
        let deadline = BuildDeadline::start(config.build_timeout);
        info!(
            sources = %display_paths(&config.sources),
            model = %config.embedding.model,
            backend = %config.embedding.backend,
            "Building knowledge base"
        );

        let documents = load_all(&config.sources)?;
        deadline.check()?;

        let embedder = self.embedder(config)?;
        let batch_size = config.embedding.batch_size.min(embedder.max_batch_size());
        let vectors = embed_documents(embedder.as_ref(), &documents, batch_size, &deadline)?;

        let dimension = vectors
            .first()
            .map(Vec::len)
            .or(embedder.info().dimension)
            .unwrap_or(0);
        let index = FlatIndex::build(dimension, &vectors)?;

        let manifest = CacheManifest {
            format_version: FORMAT_VERSION,
            fingerprint: fingerprint.to_string(),
            embedding_model: config.embedding.model.clone(),
            embedding_backend: config.embedding.backend,
            dimension,
            document_count: documents.len(),
            index_checksum: index.checksum(),
            created_at: Utc::now(),
        };
        let sidecar = CacheSidecar {
            manifest,
            documents,
        };

        deadline.check()?;
        persist(paths, &index, &sidecar)?;

        info!(
            documents = sidecar.documents.len(),
            dim = dimension,
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            "Knowledge base built"
        );

        Ok(KnowledgeBase {
            documents: sidecar.documents,
            index,
            manifest: sidecar.manifest,
            origin: LoadOrigin::Rebuilt,
            cache_dir: paths.dir.clone(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_cache(
    paths: &CachePaths,
    fingerprint: &Fingerprint,
    embedding: &EmbeddingSettings,
) -> CacheCheck {
    if !paths.sidecar.exists() {
        return CacheCheck::Missing;
    }

    let sidecar = match CacheSidecar::read(&paths.sidecar) {
        Ok(sidecar) => sidecar,
        Err(e) => return CacheCheck::Corrupt(e.to_string()),
    };

    if let Err(reason) = sidecar.manifest.check(
        fingerprint,
        &embedding.model,
        embedding.backend,
        embedding.dimensions,
    ) {
        return CacheCheck::Stale {
            manifest: sidecar.manifest,
            reason,
        };
    }

    let index = match FlatIndex::load_expecting(&paths.vectors, sidecar.manifest.dimension) {
        Ok(index) => index,
        Err(e) => return CacheCheck::Corrupt(e.to_string()),
    };
    if index.len() != sidecar.manifest.document_count {
        return CacheCheck::Corrupt(format!(
            "index holds {} vectors, manifest says {}",
            index.len(),
            sidecar.manifest.document_count
        ));
    }
    if index.checksum() != sidecar.manifest.index_checksum {
        return CacheCheck::Corrupt("index checksum does not match manifest".to_string());
    }

    CacheCheck::Fresh { sidecar, index }
}

fn embed_documents(
    embedder: &dyn EmbeddingModel,
    documents: &[DocumentRecord],
    batch_size: usize,
    deadline: &BuildDeadline,
) -> Result<Vec<Vec<f32>>, KbError> {
    let mut vectors = Vec::with_capacity(documents.len());
    let mut dimension = embedder.info().dimension;

    for chunk in documents.chunks(batch_size.max(1)) {
        deadline.check()?;
        let texts: Vec<&str> = chunk.iter().map(|d| d.text.as_str()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidInput(format!(
                "provider returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            ))
            .into());
        }
        dimension = check_dimensions(&embeddings, dimension)?;
        vectors.extend(embeddings.into_iter().map(Embedding::into_values));
        debug!(embedded = vectors.len(), total = documents.len(), "Embedded batch");
    }

    deadline.check()?;
    Ok(vectors)
}

/// Write both artifacts to temp files, then rename vectors and sidecar into place.
///
/// The previous vectors file is moved aside first and put back if either
/// rename fails, so a failed persist leaves the old pair as it was.
fn persist(paths: &CachePaths, index: &FlatIndex, sidecar: &CacheSidecar) -> Result<(), KbError> {
    std::fs::create_dir_all(&paths.dir)?;

    let mut vectors = NamedTempFile::new_in(&paths.dir)?;
    vectors.write_all(&index.to_bytes())?;
    vectors.as_file().sync_all()?;

    let mut json = NamedTempFile::new_in(&paths.dir)?;
    serde_json::to_writer(&mut json, sidecar)?;
    json.flush()?;
    json.as_file().sync_all()?;

    let backup = paths.backup_path();
    let had_previous = paths.vectors.is_file();
    if had_previous {
        std::fs::rename(&paths.vectors, &backup)?;
    }

    let swapped = vectors
        .persist(&paths.vectors)
        .map_err(|e| KbError::Io(e.error))
        .and_then(|_| {
            json.persist(&paths.sidecar)
                .map(|_| ())
                .map_err(|e| KbError::Io(e.error))
        });

    if let Err(e) = swapped {
        let restored = if had_previous {
            std::fs::rename(&backup, &paths.vectors)
        } else {
            std::fs::remove_file(&paths.vectors).or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
        };
        if let Err(restore) = restored {
            warn!(error = %restore, path = %paths.vectors.display(), "Could not restore previous index");
        }
        return Err(e);
    }

    if had_previous {
        if let Err(e) = std::fs::remove_file(&backup) {
            warn!(error = %e, path = %backup.display(), "Could not remove index backup");
        }
    }

    debug!(path = %paths.sidecar.display(), "Persisted knowledge base artifacts");
    Ok(())
}
