//! Zip packaging for conversion-only results.
//!
//! Entries are named `{prefix}-{index}[-{label}].{ext}` with a 1-based,
//! zero-padded index, so archive order, name order and input order agree.

use crate::error::OcrError;
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// One file to be placed in an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Optional suffix after the index, e.g. the source file stem.
    pub label: Option<String>,
    /// Extension without the leading dot.
    pub extension: String,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(extension: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            label: None,
            extension: extension.into(),
            data,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Name of entry `index` (1-based) out of `total`.
pub fn entry_name(prefix: &str, index: usize, total: usize, label: Option<&str>, extension: &str) -> String {
    let width = total.max(1).to_string().len();
    match label {
        Some(label) => format!("{prefix}-{index:0width$}-{label}.{extension}"),
        None => format!("{prefix}-{index:0width$}.{extension}"),
    }
}

/// Build an in-memory zip holding `entries` in order.
pub fn build_archive(prefix: &str, entries: &[ArchiveEntry]) -> Result<Vec<u8>, OcrError> {
    if entries.is_empty() {
        return Err(OcrError::ArchiveError("nothing to archive".to_string()));
    }

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (i, entry) in entries.iter().enumerate() {
        let name = entry_name(prefix, i + 1, entries.len(), entry.label.as_deref(), &entry.extension);
        zip.start_file(name.as_str(), options)
            .map_err(|e| OcrError::ArchiveError(format!("{name}: {e}")))?;
        zip.write_all(&entry.data)
            .map_err(|e| OcrError::ArchiveError(format!("{name}: {e}")))?;
    }

    let bytes = zip
        .finish()
        .map_err(|e| OcrError::ArchiveError(e.to_string()))?
        .into_inner();
    debug!(prefix, entries = entries.len(), bytes = bytes.len(), "Archive built");
    Ok(bytes)
}
