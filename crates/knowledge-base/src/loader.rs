//! Tabular source loading.
//!
//! Every data row of a CSV/TSV file or of the first worksheet of a workbook
//! becomes one [`DocumentRecord`] whose text is `"column: value | ..."` over
//! the row's non-empty cells.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{NaiveDateTime, Timelike};
use tracing::{debug, info};

use knowledge_types::{expand_path, DocumentRecord};

use crate::error::KbError;

const FIELD_SEPARATOR: &str = " | ";

/// File formats the loader understands, picked by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Tsv,
    /// xlsx, xlsm, xls or ods; first worksheet only
    Workbook,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(Self::Workbook),
            _ => None,
        }
    }
}

/// Load one source file.
pub fn load_documents(path: &Path) -> Result<Vec<DocumentRecord>, KbError> {
    if !path.is_file() {
        return Err(KbError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: "file not found".to_string(),
        });
    }

    let format = SourceFormat::from_path(path).ok_or_else(|| KbError::MalformedSource {
        path: path.to_path_buf(),
        reason: "unsupported file extension".to_string(),
    })?;

    let rows = match format {
        SourceFormat::Csv => read_delimited(path, b',')?,
        SourceFormat::Tsv => read_delimited(path, b'\t')?,
        SourceFormat::Workbook => read_workbook(path)?,
    };

    let records = rows.into_records(&path.to_string_lossy());
    debug!(path = %path.display(), records = records.len(), "Loaded source");
    Ok(records)
}

/// Load every source in order and concatenate the records.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<DocumentRecord>, KbError> {
    let mut documents = Vec::new();
    for path in paths {
        documents.extend(load_documents(path.as_ref())?);
    }
    info!(sources = paths.len(), documents = documents.len(), "Loaded documents");
    Ok(documents)
}

/// Turn configured source entries into paths.
///
/// Each entry may itself be a comma-separated list. Blank items are
/// dropped, `~` is expanded and relative paths are joined onto `base`.
pub fn resolve_source_paths<S: AsRef<str>>(entries: &[S], base: &Path) -> Vec<PathBuf> {
    entries
        .iter()
        .flat_map(|entry| entry.as_ref().split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let path = expand_path(item);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        })
        .collect()
}

/// Header plus data rows with the spreadsheet row number of each.
struct Table {
    headers: Vec<String>,
    rows: Vec<(u64, Vec<String>)>,
}

impl Table {
    fn new(raw_headers: Vec<String>) -> Self {
        Self {
            headers: normalize_headers(raw_headers),
            rows: Vec::new(),
        }
    }

    fn into_records(self, source_path: &str) -> Vec<DocumentRecord> {
        let Table { headers, rows } = self;
        rows.into_iter()
            .filter_map(|(row_number, cells)| {
                let fields: Vec<(&str, &str)> = headers
                    .iter()
                    .zip(cells.iter())
                    .map(|(h, v)| (h.as_str(), v.trim()))
                    .filter(|(_, v)| !v.is_empty())
                    .collect();
                if fields.is_empty() {
                    return None;
                }

                let text = fields
                    .iter()
                    .map(|(h, v)| format!("{}: {}", h, v))
                    .collect::<Vec<_>>()
                    .join(FIELD_SEPARATOR);
                let metadata: BTreeMap<String, String> = fields
                    .iter()
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect();

                Some(DocumentRecord::new(text, source_path, row_number, metadata))
            })
            .collect()
    }
}

/// Trim headers, name blank ones `column_<n>` and suffix duplicates.
fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, header)| {
            let trimmed = header.trim();
            let name = if trimmed.is_empty() {
                format!("column_{}", i + 1)
            } else {
                trimmed.to_string()
            };
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                name
            } else {
                format!("{}.{}", name, *count - 1)
            }
        })
        .collect()
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Table, KbError> {
    let malformed = |e: csv::Error| KbError::MalformedSource {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| KbError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let headers = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(str::to_string)
        .collect();
    let mut table = Table::new(headers);

    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(malformed)?;
        // Header is row 1
        table
            .rows
            .push((i as u64 + 2, record.iter().map(str::to_string).collect()));
    }

    Ok(table)
}

fn read_workbook(path: &Path) -> Result<Table, KbError> {
    let malformed = |reason: String| KbError::MalformedSource {
        path: path.to_path_buf(),
        reason,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| malformed(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| malformed("workbook has no worksheets".to_string()))?
        .map_err(|e| malformed(e.to_string()))?;

    // Absolute row of the first used row; leading blank rows are not stored
    let first_row = range.start().map(|(row, _)| row as u64).unwrap_or(0);
    let mut rows = range.rows();

    let Some(header) = rows.next() else {
        return Ok(Table::new(Vec::new()));
    };
    let mut table = Table::new(header.iter().map(cell_text).collect());

    for (i, row) in rows.enumerate() {
        let row_number = first_row + i as u64 + 2;
        table.rows.push((row_number, row.iter().map(cell_text).collect()));
    }

    Ok(table)
}

/// Cell value as text; error cells read as empty.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::DateTime(value) => match value.as_datetime() {
            Some(datetime) if value.is_datetime() => format_datetime(datetime),
            _ => value.as_f64().to_string(),
        },
        other => other.to_string(),
    }
}

/// `YYYY-MM-DD`, with the time only when it is not midnight.
fn format_datetime(datetime: NaiveDateTime) -> String {
    if datetime.num_seconds_from_midnight() == 0 {
        datetime.format("%Y-%m-%d").to_string()
    } else {
        datetime.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}
