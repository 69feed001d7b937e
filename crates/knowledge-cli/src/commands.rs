//! Command implementations.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

use knowledge_base::{CacheStatus, KnowledgeBaseConfig, KnowledgeBaseManager, LoadOrigin};
use knowledge_types::{EmbeddingBackend, Settings};

use crate::cli::{Cli, Commands, SourceArgs};

const REDACTED: &str = "<redacted>";

/// Load layered settings and apply CLI overrides.
pub fn load_settings(
    config_path: Option<&str>,
    log_level: Option<&str>,
    overrides: &SourceArgs,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    apply_overrides(&mut settings, overrides)?;
    Ok(settings)
}

/// Apply flag overrides (highest precedence) and re-validate.
pub fn apply_overrides(settings: &mut Settings, overrides: &SourceArgs) -> Result<()> {
    if let Some(paths) = &overrides.paths {
        settings.sources = vec![paths.clone()];
    }
    if let Some(model) = &overrides.embedding_model {
        settings.embedding.model = model.clone();
    }
    if let Some(backend) = &overrides.embedding_backend {
        settings.embedding.backend = backend
            .parse::<EmbeddingBackend>()
            .context("Invalid --embedding-backend")?;
    }
    if let Some(batch_size) = overrides.batch_size {
        settings.embedding.batch_size = batch_size;
    }
    if let Some(cache_dir) = &overrides.cache_dir {
        settings.cache_dir = cache_dir.clone();
    }
    if let Some(timeout) = overrides.timeout_secs {
        settings.build_timeout_secs = Some(timeout);
    }
    settings
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")
}

/// Install the global tracing subscriber; `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Entry point shared by `main`.
pub fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(
        cli.config.as_deref(),
        cli.log_level.as_deref(),
        cli.command.source_args(),
    )?;
    init_logging(&settings.log_level)?;

    match cli.command {
        Commands::Build { .. } => run_build(&settings),
        Commands::Query {
            text,
            top_k,
            offset,
            ..
        } => run_query(&settings, &text, top_k.unwrap_or(settings.top_k), offset),
        Commands::Status { .. } => run_status(&settings),
        Commands::Invalidate { purge, .. } => run_invalidate(&settings, purge),
        Commands::Config { .. } => run_config(&settings),
    }
}

fn knowledge_base_config(settings: &Settings) -> Result<KnowledgeBaseConfig> {
    let config = KnowledgeBaseConfig::from_settings(settings);
    if config.sources.is_empty() {
        bail!("No knowledge base sources configured (use --paths or set `sources`)");
    }
    Ok(config)
}

/// `"<path> (1.25 MB)"`, or `"<path> (missing)"`.
pub fn describe_file(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            format!("{} ({:.2} MB)", path.display(), meta.len() as f64 / (1024.0 * 1024.0))
        }
        _ => format!("{} (missing)", path.display()),
    }
}

fn print_sources(config: &KnowledgeBaseConfig) {
    println!("Sources:");
    for path in &config.sources {
        println!("  - {}", describe_file(path));
    }
}

/// Build or validate the cache so later queries start warm.
pub fn run_build(settings: &Settings) -> Result<()> {
    let config = knowledge_base_config(settings)?;
    print_sources(&config);
    println!(
        "Embedding: {} ({})",
        config.embedding.model, config.embedding.backend
    );

    let started = Instant::now();
    let kb = KnowledgeBaseManager::new()
        .ensure_ready(&config)
        .context("Failed to build knowledge base")?;

    if kb.is_empty() {
        bail!("Knowledge base is empty: no rows found in the configured sources");
    }

    let origin = match kb.origin() {
        LoadOrigin::Fresh => "loaded from cache",
        LoadOrigin::Rebuilt => "rebuilt",
    };
    println!(
        "Knowledge base {}: {} documents, dimension {}, {:.2}s",
        origin,
        kb.document_count(),
        kb.manifest().dimension,
        started.elapsed().as_secs_f64()
    );
    let stats = kb.index().stats();
    println!(
        "Cache directory: {} (index {:.2} MB)",
        kb.cache_dir().display(),
        stats.size_bytes as f64 / (1024.0 * 1024.0)
    );
    info!(documents = kb.document_count(), "Build command finished");
    Ok(())
}

/// Print cited top-k hits for `text`.
pub fn run_query(settings: &Settings, text: &str, top_k: usize, offset: usize) -> Result<()> {
    let config = knowledge_base_config(settings)?;
    let retriever = KnowledgeBaseManager::new()
        .retriever(&config)
        .context("Knowledge base unavailable")?;

    let records = retriever
        .retrieve(text, top_k, offset)
        .context("Query failed")?;

    if records.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for record in &records {
        println!("[{}] {:.4}  {}", record.citation, record.score, record.location());
        println!("    {}", record.text);
    }
    if records.len() < settings.min_hits {
        println!(
            "Only {} result(s), below min_hits = {}",
            records.len(),
            settings.min_hits
        );
    }
    Ok(())
}

/// Report cache freshness without building.
pub fn run_status(settings: &Settings) -> Result<()> {
    let config = knowledge_base_config(settings)?;
    print_sources(&config);
    let paths = config.cache_paths();

    let status = KnowledgeBaseManager::new()
        .inspect(&config)
        .context("Cannot fingerprint sources")?;

    match status {
        CacheStatus::Missing => println!("Cache: missing ({})", paths.sidecar.display()),
        CacheStatus::Fresh(manifest) => {
            println!("Cache: fresh ({})", paths.sidecar.display());
            println!(
                "  {} documents, {} ({}), dimension {}, built {}",
                manifest.document_count,
                manifest.embedding_model,
                manifest.embedding_backend,
                manifest.dimension,
                manifest.created_at.to_rfc3339()
            );
        }
        CacheStatus::Stale { manifest, reason } => {
            println!("Cache: stale, {}", reason);
            println!(
                "  built {} with {} documents",
                manifest.created_at.to_rfc3339(),
                manifest.document_count
            );
        }
        CacheStatus::Corrupt(reason) => println!("Cache: corrupt, {}", reason),
    }
    Ok(())
}

/// Remove the cached artifacts for the configured sources.
pub fn run_invalidate(settings: &Settings, purge: bool) -> Result<()> {
    let config = knowledge_base_config(settings)?;
    KnowledgeBaseManager::new()
        .invalidate(&config, purge)
        .context("Failed to invalidate cache")?;
    if purge {
        println!("Removed cached index for {} source(s)", config.sources.len());
    } else {
        println!("Nothing cached in memory; pass --purge to delete the index files");
    }
    Ok(())
}

/// Effective settings as TOML with the API key hidden.
pub fn render_config(settings: &Settings) -> Result<String> {
    let mut redacted = settings.clone();
    if redacted.embedding.api_key.is_some() {
        redacted.embedding.api_key = Some(REDACTED.to_string());
    }
    toml::to_string_pretty(&redacted).context("Failed to render configuration")
}

pub fn run_config(settings: &Settings) -> Result<()> {
    print!("{}", render_config(settings)?);
    Ok(())
}
