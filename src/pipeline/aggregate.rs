//! Fold per-page results into a [`Document`].

use crate::config::AccuracyTier;
use crate::error::OcrError;
use crate::output::Document;
use crate::output::Page;
use std::time::Duration;
use tracing::info;

/// Sort `pages` and wrap them, checking that every page `1..=page_count`
/// is present exactly once.
pub fn assemble(
    filename: &str,
    page_count: usize,
    mut pages: Vec<Page>,
    elapsed: Duration,
    accuracy: AccuracyTier,
) -> Result<Document, OcrError> {
    pages.sort_by_key(|p| p.number);

    let contiguous = pages.len() == page_count
        && pages.iter().enumerate().all(|(i, p)| p.number == i + 1);
    if !contiguous {
        let numbers: Vec<usize> = pages.iter().map(|p| p.number).collect();
        return Err(OcrError::Internal(format!(
            "expected pages 1..={page_count} for '{filename}', got {numbers:?}"
        )));
    }

    let document = Document {
        filename: filename.to_string(),
        page_count,
        accuracy,
        pages,
        elapsed,
    };
    info!(
        filename,
        pages = page_count,
        ocr = document.ocr_pages(),
        text_layer = document.text_layer_pages(),
        degraded = document.degraded_pages(),
        runtime = %document.runtime(),
        "Document assembled"
    );
    Ok(document)
}
