//! Cache manager lifecycle: fresh loads, invalidation triggers, failures
//! that must leave the cache alone, and single-builder concurrency.

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use common::{
    config, local_settings, numbered_source, seven_row_sources, snapshot, write_file,
    CountingFactory,
};
use knowledge_base::{
    CacheState, CacheStatus, KbError, KnowledgeBaseManager, LoadOrigin, StaleReason,
};
use knowledge_embeddings::{EmbedderFactory, EmbeddingError, EmbeddingModel, HashEmbedder};
use knowledge_types::EmbeddingSettings;

#[test]
fn test_build_then_fresh_load_in_new_manager() {
    let temp = TempDir::new().unwrap();
    let sources = seven_row_sources(temp.path());
    let cache_dir = temp.path().join("cache");
    let config = config(sources, &cache_dir);

    let factory = CountingFactory::new();
    let manager = KnowledgeBaseManager::with_factory(factory.clone());
    let kb = manager.ensure_ready(&config).unwrap();

    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
    assert_eq!(kb.document_count(), 7);
    assert_eq!(kb.index().len(), 7);
    assert_eq!(kb.manifest().dimension, 64);
    assert_eq!(factory.stats.texts(), 7);
    assert_eq!(manager.state(&config), CacheState::Ready);

    let rows: Vec<(&str, u64)> = kb
        .documents()
        .iter()
        .map(|d| (d.source_name(), d.row_index))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("companies.csv", 2),
            ("companies.csv", 4),
            ("companies.csv", 5),
            ("concepts.tsv", 2),
            ("concepts.tsv", 3),
            ("concepts.tsv", 5),
            ("concepts.tsv", 6),
        ]
    );

    // A second process sees a valid cache and never touches the embedder
    let reload_factory = CountingFactory::new();
    let reloaded = KnowledgeBaseManager::with_factory(reload_factory.clone())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(reloaded.origin(), LoadOrigin::Fresh);
    assert_eq!(reloaded.documents(), kb.documents());
    assert_eq!(reloaded.index(), kb.index());
    assert_eq!(reload_factory.stats.created(), 0);
    assert_eq!(reload_factory.stats.calls(), 0);
}

#[test]
fn test_ready_instance_is_shared() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());

    let first = manager.ensure_ready(&config).unwrap();
    let second = manager.ensure_ready(&config).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_source_change_triggers_rebuild() {
    let temp = TempDir::new().unwrap();
    let sources = seven_row_sources(temp.path());
    let config = config(sources.clone(), &temp.path().join("cache"));
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();

    let mut file = OpenOptions::new().append(true).open(&sources[0]).unwrap();
    writeln!(file, "LONGi,solar,Xi'an").unwrap();
    drop(file);

    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());
    assert!(matches!(
        manager.inspect(&config).unwrap(),
        CacheStatus::Stale {
            reason: StaleReason::SourcesChanged,
            ..
        }
    ));
    let kb = manager.ensure_ready(&config).unwrap();
    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
    assert_eq!(kb.document_count(), 8);
}

#[test]
fn test_model_change_triggers_rebuild() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();

    let other_model = config.clone().with_embedding(local_settings("hash-32"));
    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());
    match manager.inspect(&other_model).unwrap() {
        CacheStatus::Stale {
            manifest,
            reason: StaleReason::ModelChanged { cached, configured },
        } => {
            assert_eq!(manifest.embedding_model, "hash-64");
            assert_eq!(cached, "hash-64");
            assert_eq!(configured, "hash-32");
        }
        other => panic!("expected stale cache, got {:?}", other),
    }

    let kb = manager.ensure_ready(&other_model).unwrap();
    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
    assert_eq!(kb.manifest().embedding_model, "hash-32");
    assert_eq!(kb.manifest().dimension, 32);
}

#[test]
fn test_corrupt_vectors_rebuild_silently() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();

    let paths = config.cache_paths();
    let mut bytes = std::fs::read(&paths.vectors).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    std::fs::write(&paths.vectors, bytes).unwrap();

    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());
    assert!(matches!(
        manager.inspect(&config).unwrap(),
        CacheStatus::Corrupt(_)
    ));
    let kb = manager.ensure_ready(&config).unwrap();
    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
    assert_eq!(kb.document_count(), 7);

    let again = KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(again.origin(), LoadOrigin::Fresh);
}

#[test]
fn test_garbage_sidecar_rebuilds() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();

    std::fs::write(&config.cache_paths().sidecar, "{\"manifest\": 12").unwrap();

    let kb = KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
}

#[test]
fn test_missing_vectors_file_rebuilds() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();

    std::fs::remove_file(&config.cache_paths().vectors).unwrap();

    let kb = KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(kb.origin(), LoadOrigin::Rebuilt);
}

#[test]
fn test_embedding_failure_leaves_cache_untouched() {
    let temp = TempDir::new().unwrap();
    let sources = seven_row_sources(temp.path());
    let cache_dir = temp.path().join("cache");
    let config = config(sources.clone(), &cache_dir);
    KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();
    let before = snapshot(&cache_dir);
    assert_eq!(before.len(), 2);

    write_file(temp.path(), "companies.csv", "name\nNew Hope\n");

    let manager = KnowledgeBaseManager::with_factory(CountingFactory::failing());
    let result = manager.ensure_ready(&config);
    assert!(matches!(
        result,
        Err(KbError::EmbeddingService(EmbeddingError::Service { attempts: 3, .. }))
    ));
    assert_eq!(manager.state(&config), CacheState::Unloaded);
    assert_eq!(snapshot(&cache_dir), before);
}

#[test]
fn test_malformed_source_fails_build() {
    let temp = TempDir::new().unwrap();
    let bad = write_file(temp.path(), "bad.csv", "a,b\n1,2,3\n");
    let cache_dir = temp.path().join("cache");
    let config = config(vec![bad], &cache_dir);

    let factory = CountingFactory::new();
    let result = KnowledgeBaseManager::with_factory(factory.clone()).ensure_ready(&config);
    assert!(matches!(result, Err(KbError::MalformedSource { .. })));
    assert_eq!(factory.stats.calls(), 0);
    assert!(!cache_dir.exists());
}

#[test]
fn test_missing_source_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let config = config(vec![temp.path().join("absent.xlsx")], &temp.path().join("cache"));
    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());

    assert!(matches!(
        manager.ensure_ready(&config),
        Err(KbError::SourceUnavailable { .. })
    ));
    assert_eq!(manager.state(&config), CacheState::Unloaded);
}

#[test]
fn test_build_timeout_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let cache_dir = temp.path().join("cache");
    let mut config = config(seven_row_sources(temp.path()), &cache_dir)
        .with_build_timeout(Duration::from_millis(60));
    config.embedding.batch_size = 1;

    let manager =
        KnowledgeBaseManager::with_factory(CountingFactory::slow(Duration::from_millis(40)));
    let result = manager.ensure_ready(&config);

    assert!(matches!(result, Err(KbError::BuildTimeout { .. })));
    assert!(!cache_dir.exists());
    assert_eq!(manager.state(&config), CacheState::Unloaded);
}

#[test]
fn test_concurrent_callers_share_one_build() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let factory = CountingFactory::slow(Duration::from_millis(20));
    let manager = KnowledgeBaseManager::with_factory(factory.clone());

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| manager.ensure_ready(&config).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for kb in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], kb));
    }
    assert_eq!(results[0].origin(), LoadOrigin::Rebuilt);
    assert_eq!(factory.stats.created(), 1);
    assert_eq!(factory.stats.texts(), 7);
}

#[test]
fn test_invalidate_and_purge() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());

    assert!(matches!(manager.inspect(&config).unwrap(), CacheStatus::Missing));
    let first = manager.ensure_ready(&config).unwrap();
    assert!(matches!(manager.inspect(&config).unwrap(), CacheStatus::Fresh(_)));

    // Dropping in-memory state keeps the artifacts
    manager.invalidate(&config, false).unwrap();
    assert_eq!(manager.state(&config), CacheState::Unloaded);
    let reloaded = manager.ensure_ready(&config).unwrap();
    assert!(!Arc::ptr_eq(&first, &reloaded));
    assert_eq!(reloaded.origin(), LoadOrigin::Fresh);

    manager.invalidate(&config, true).unwrap();
    assert!(!config.cache_paths().any_exists());
    let rebuilt = manager.ensure_ready(&config).unwrap();
    assert_eq!(rebuilt.origin(), LoadOrigin::Rebuilt);
}

#[test]
fn test_header_only_source_builds_empty_base() {
    let temp = TempDir::new().unwrap();
    let empty = write_file(temp.path(), "empty.csv", "name,industry\n");
    let config = config(vec![empty], &temp.path().join("cache"));
    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());

    let kb = manager.ensure_ready(&config).unwrap();
    assert!(kb.is_empty());
    assert_eq!(kb.manifest().document_count, 0);

    let reloaded = KnowledgeBaseManager::with_factory(CountingFactory::new())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(reloaded.origin(), LoadOrigin::Fresh);
    assert!(reloaded.is_empty());
}

#[test]
fn test_local_batches_ignore_service_limit() {
    let temp = TempDir::new().unwrap();
    let mut config = config(vec![numbered_source(temp.path(), 12)], &temp.path().join("cache"));
    config.embedding.batch_size = 25;

    let factory = CountingFactory::new();
    KnowledgeBaseManager::with_factory(factory.clone())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(factory.stats.texts(), 12);
    assert_eq!(factory.stats.calls(), 1);
}

#[test]
fn test_batches_respect_provider_limit() {
    let temp = TempDir::new().unwrap();
    let mut config = config(vec![numbered_source(temp.path(), 12)], &temp.path().join("cache"));
    config.embedding.batch_size = 25;

    let factory = CountingFactory::capped(5);
    KnowledgeBaseManager::with_factory(factory.clone())
        .ensure_ready(&config)
        .unwrap();
    assert_eq!(factory.stats.texts(), 12);
    assert_eq!(factory.stats.calls(), 3);
}

#[test]
fn test_embedder_registry_separates_dimensions() {
    let temp = TempDir::new().unwrap();
    let base = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let mut sized = base.clone();
    sized.embedding.dimensions = Some(64);

    let factory = CountingFactory::new();
    let manager = KnowledgeBaseManager::with_factory(factory.clone());
    let first = manager.embedder(&base).unwrap();
    let again = manager.embedder(&base).unwrap();
    let other = manager.embedder(&sized).unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(factory.stats.created(), 2);
}

/// Holds back creation of `hash-32` until released.
struct GatedFactory {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl EmbedderFactory for GatedFactory {
    fn create(
        &self,
        settings: &EmbeddingSettings,
    ) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        if settings.model == "hash-32" {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| EmbeddingError::Config("released too late".to_string()))?;
        }
        let embedder = HashEmbedder::from_model_id(&settings.model).unwrap()?;
        Ok(Arc::new(embedder))
    }
}

#[test]
fn test_slow_provider_does_not_block_others() {
    let temp = TempDir::new().unwrap();
    let fast = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let slow = fast.clone().with_embedding(local_settings("hash-32"));

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let manager = KnowledgeBaseManager::with_factory(Arc::new(GatedFactory {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    }));

    thread::scope(|scope| {
        let pending = scope.spawn(|| manager.embedder(&slow));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Another provider is available while the slow one is still loading
        let embedder = manager.embedder(&fast).unwrap();
        assert_eq!(embedder.info().dimension, Some(64));

        release_tx.send(()).unwrap();
        let slow_embedder = pending.join().unwrap().unwrap();
        assert_eq!(slow_embedder.info().dimension, Some(32));
    });
}

#[test]
fn test_failed_swap_keeps_previous_vectors() {
    let temp = TempDir::new().unwrap();
    let config = config(seven_row_sources(temp.path()), &temp.path().join("cache"));
    let paths = config.cache_paths();
    std::fs::create_dir_all(&paths.dir).unwrap();
    std::fs::write(&paths.vectors, b"previous vectors").unwrap();
    // A directory where the sidecar goes makes the final rename fail
    std::fs::create_dir_all(&paths.sidecar).unwrap();

    let manager = KnowledgeBaseManager::with_factory(CountingFactory::new());
    assert!(matches!(manager.ensure_ready(&config), Err(KbError::Io(_))));

    assert_eq!(std::fs::read(&paths.vectors).unwrap(), b"previous vectors");
    assert!(!paths.backup_path().exists());
    let leftovers: Vec<_> = std::fs::read_dir(&paths.dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name())
        .collect();
    assert_eq!(leftovers.len(), 2, "unexpected files: {:?}", leftovers);
}
