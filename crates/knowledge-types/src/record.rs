//! Source file descriptors and document records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Filesystem identity of one source file for a single build cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    pub modified: SystemTime,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }

    /// Modification time as nanoseconds since the Unix epoch.
    ///
    /// Times before the epoch collapse to zero.
    pub fn modified_nanos(&self) -> u128 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }
}

/// One retrievable row of a tabular source.
///
/// Records are created once by the loader and never mutated. Their position
/// in the document list is the join key into the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Normalized `"column: value | column: value"` text used for embedding
    pub text: String,
    /// Path of the file the row came from
    pub source_path: String,
    /// Spreadsheet row number (header is row 1, first data row is 2)
    pub row_index: u64,
    /// Original non-empty cell values keyed by column header
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DocumentRecord {
    pub fn new(
        text: impl Into<String>,
        source_path: impl Into<String>,
        row_index: u64,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_path: source_path.into(),
            row_index,
            metadata,
        }
    }

    /// File name of the source, falling back to the full path.
    pub fn source_name(&self) -> &str {
        Path::new(&self.source_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.source_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_source_name_uses_file_name() {
        let record = DocumentRecord::new("a: 1", "/data/concepts.xlsx", 2, BTreeMap::new());
        assert_eq!(record.source_name(), "concepts.xlsx");
    }

    #[test]
    fn test_modified_nanos() {
        let file = SourceFile::new(
            "x.csv",
            10,
            UNIX_EPOCH + Duration::from_nanos(1_500),
        );
        assert_eq!(file.modified_nanos(), 1_500);
    }

    #[test]
    fn test_record_serialization_keeps_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("code".to_string(), "600519".to_string());
        let record = DocumentRecord::new("code: 600519", "a.csv", 2, metadata);

        let json = serde_json::to_string(&record).unwrap();
        let decoded: DocumentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
