//! On-disk store for local model files.
//!
//! Layout: `<root>/<org>--<name>/<revision>/{config.json,tokenizer.json,model.safetensors}`.
//! A revision directory only appears once all three files are present and
//! `config.json` names a `hidden_size`; downloads are staged in a sibling
//! temp directory and renamed into place.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use knowledge_types::{expand_path, EmbeddingSettings};

use crate::error::EmbeddingError;

/// Default local model on HuggingFace
pub const DEFAULT_MODEL_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Revision used when the model id does not pin one
pub const DEFAULT_REVISION: &str = "main";

/// Files a BERT sentence-transformer needs
pub const MODEL_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

/// Split `"org/name@revision"` into repo id and revision.
pub fn split_model_id(model_id: &str) -> (&str, &str) {
    match model_id.rsplit_once('@') {
        Some((repo, revision)) if !repo.is_empty() && !revision.is_empty() => (repo, revision),
        _ => (model_id, DEFAULT_REVISION),
    }
}

/// Read `hidden_size` from a BERT config.json.
pub fn read_hidden_size(config_json: &str) -> Result<usize, EmbeddingError> {
    let value: serde_json::Value = serde_json::from_str(config_json)
        .map_err(|e| EmbeddingError::ModelNotFound(format!("Invalid config: {}", e)))?;
    value
        .get("hidden_size")
        .and_then(|v| v.as_u64())
        .filter(|v| *v > 0)
        .map(|v| v as usize)
        .ok_or_else(|| EmbeddingError::ModelNotFound("config.json has no hidden_size".to_string()))
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("knowledge-base")
        .join("models")
}

/// Cached files of one local model revision.
#[derive(Debug, Clone)]
pub struct ModelCache {
    pub root: PathBuf,
    /// Id as configured, revision suffix included
    pub model_id: String,
    pub repo_id: String,
    pub revision: String,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(default_root(), DEFAULT_MODEL_REPO)
    }
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let (repo_id, revision) = split_model_id(&model_id);
        Self {
            root: root.into(),
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            model_id,
        }
    }

    /// Honors `model_cache_dir`, else the user cache directory.
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        let root = settings
            .model_cache_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(default_root);
        Self::new(root, settings.model.clone())
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root
            .join(self.repo_id.replace('/', "--"))
            .join(self.revision.replace(['/', '\\'], "_"))
    }

    /// Paths of a complete cached revision, or `None`.
    pub fn cached(&self) -> Option<ModelPaths> {
        ModelPaths::validate(&self.model_dir()).ok()
    }

    /// Cached files, downloading them from the Hub first if needed.
    pub fn get_or_download(&self) -> Result<ModelPaths, EmbeddingError> {
        if let Some(paths) = self.cached() {
            debug!(path = %paths.dir.display(), "Using cached model");
            return Ok(paths);
        }
        info!(repo = %self.repo_id, revision = %self.revision, "Downloading model files");
        self.install(hub_fetcher(&self.repo_id, &self.revision)?)
    }

    /// Stage every file from `fetch`, validate, then move the revision into place.
    ///
    /// `fetch` returns a local path holding the named file.
    pub fn install<F>(&self, mut fetch: F) -> Result<ModelPaths, EmbeddingError>
    where
        F: FnMut(&str) -> Result<PathBuf, EmbeddingError>,
    {
        let target = self.model_dir();
        let parent = target
            .parent()
            .ok_or_else(|| EmbeddingError::Config(format!("bad model dir {}", target.display())))?;
        std::fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(parent)?;
        for filename in MODEL_FILES {
            let source = fetch(filename)?;
            std::fs::copy(&source, staging.path().join(filename))?;
            debug!(file = filename, "Staged model file");
        }
        ModelPaths::validate(staging.path())?;

        if target.exists() {
            warn!(path = %target.display(), "Replacing incomplete model cache");
            std::fs::remove_dir_all(&target)?;
        }
        move_into_place(staging, &target)?;
        ModelPaths::validate(&target)
    }
}

/// Renames the staged directory; the emptied `TempDir` guard is then dropped.
fn move_into_place(staging: TempDir, target: &Path) -> Result<(), EmbeddingError> {
    std::fs::rename(staging.path(), target)?;
    Ok(())
}

fn hub_fetcher(
    repo_id: &str,
    revision: &str,
) -> Result<impl FnMut(&str) -> Result<PathBuf, EmbeddingError>, EmbeddingError> {
    use hf_hub::api::sync::Api;
    use hf_hub::{Repo, RepoType};

    let api = Api::new().map_err(|e| EmbeddingError::Download(e.to_string()))?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    Ok(move |filename: &str| {
        info!(file = filename, "Downloading");
        repo.get(filename)
            .map_err(|e| EmbeddingError::Download(format!("{}: {}", filename, e)))
    })
}

/// Validated files of one model revision.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
    /// `hidden_size` from config.json
    pub dimension: usize,
}

impl ModelPaths {
    fn validate(dir: &Path) -> Result<Self, EmbeddingError> {
        for filename in MODEL_FILES {
            let meta = std::fs::metadata(dir.join(filename))
                .map_err(|_| EmbeddingError::ModelNotFound(format!("missing {}", filename)))?;
            if meta.len() == 0 {
                return Err(EmbeddingError::ModelNotFound(format!("empty {}", filename)));
            }
        }
        let config = dir.join("config.json");
        let dimension = read_hidden_size(&std::fs::read_to_string(&config)?)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
            dimension,
        })
    }
}
