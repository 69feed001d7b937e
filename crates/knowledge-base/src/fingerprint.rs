//! Source set fingerprints.
//!
//! A fingerprint is a SHA-256 digest over the ordered `(path, size, mtime)`
//! triples of the configured sources. File contents are never read, so a
//! change that preserves both size and mtime goes unnoticed.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use knowledge_types::SourceFile;

use crate::error::KbError;

const FIELD_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

/// Hex-encoded SHA-256 identity of an ordered source set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the sources in the order given.
    pub fn compute(sources: &[SourceFile]) -> Self {
        let mut hasher = Sha256::new();
        for source in sources {
            hasher.update(source.path.to_string_lossy().as_bytes());
            hasher.update([FIELD_SEP]);
            hasher.update(source.size.to_le_bytes());
            hasher.update([FIELD_SEP]);
            hasher.update(source.modified_nanos().to_le_bytes());
            hasher.update([RECORD_SEP]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stat every path, in order.
///
/// Fails with `SourceUnavailable` on the first path that is missing,
/// unreadable or not a regular file.
pub fn describe_sources<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<SourceFile>, KbError> {
    paths
        .iter()
        .map(|path| describe_source(path.as_ref()))
        .collect()
}

fn describe_source(path: &Path) -> Result<SourceFile, KbError> {
    let unavailable = |reason: String| KbError::SourceUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| unavailable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unavailable("not a regular file".to_string()));
    }
    let modified = metadata
        .modified()
        .map_err(|e| unavailable(format!("no modification time: {}", e)))?;

    Ok(SourceFile::new(path, metadata.len(), modified))
}

/// Describe and hash the sources in one step.
pub fn fingerprint_sources<P: AsRef<Path>>(paths: &[P]) -> Result<Fingerprint, KbError> {
    let sources = describe_sources(paths)?;
    let fingerprint = Fingerprint::compute(&sources);
    debug!(sources = sources.len(), fingerprint = %fingerprint, "Computed source fingerprint");
    Ok(fingerprint)
}

/// Cache artifact base name for a path set: `kb-<16 hex chars>`.
///
/// Depends on the paths only, so edits to the files reuse the same
/// artifact slot and overwrite it on rebuild.
pub fn cache_base_name<P: AsRef<Path>>(paths: &[P]) -> String {
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.as_ref().to_string_lossy().as_bytes());
        hasher.update([RECORD_SEP]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("kb-{}", &digest[..16])
}

/// Paths of the sources, for logging.
pub(crate) fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
