//! Error types for the edgequake-ocr library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OcrError`]: **Fatal**: the request cannot proceed at all (input is
//!   not a supported format, the page count cannot be established, the
//!   caller cancelled). Returned as `Err(OcrError)` from the entry points in
//!   [`crate::convert`].
//!
//! * [`PageError`]: **Non-fatal**: a single page could not be rendered or
//!   recognised, but every other page is fine. Stored inside
//!   [`crate::output::Page`] next to the (empty) degraded result so one bad
//!   page never costs the caller the whole document.
//!
//! Single-image OCR is the exception: there is only one page, so a
//! recognition failure there is promoted to [`OcrError::RecognitionFailure`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Content cannot be parsed as the declared (or any supported) type.
    #[error(
        "Unsupported format for '{filename}': {detail}\n\
Supported inputs: PDF, PNG, JPEG (.jpg .jpeg .jpe .jfif), TIFF (.tif .tiff), BMP."
    )]
    UnsupportedFormat { filename: String, detail: String },

    /// Requested page number lies outside `1..=total`.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The renderer could not open the document or produce a page image.
    ///
    /// At document level this is fatal: without a page count there is
    /// nothing to fan out over.
    #[error("Extraction failed for '{filename}': {detail}")]
    ExtractionFailure { filename: String, detail: String },

    /// The recognition engine exited nonzero or could not be driven.
    #[error("Recognition failed for '{filename}': {detail}")]
    RecognitionFailure { filename: String, detail: String },

    /// No engine could be constructed for the requested tier.
    #[error(
        "Recognition engine unavailable: {detail}\n\
Install tesseract and point --tesseract / --tessdata-* at the binary and trained-data directories."
    )]
    EngineUnavailable { detail: String },

    /// Archive packaging failed (empty input or zip writer error).
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// The caller's cancellation token fired before all pages were submitted.
    #[error("Operation cancelled; partial results were discarded")]
    CancellationRequested,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create, write or remove scratch space.
    #[error("Scratch storage error at '{path}': {source}")]
    ScratchIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium system-wide or pass its location with --pdfium-lib \
(OCR_PDFIUM_LIB) / OcrConfigBuilder::pdfium_library."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (e.g. a worker task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// True for errors caused by the request itself rather than the host.
    ///
    /// The CLI uses this to choose between exit codes 2 and 1.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            OcrError::UnsupportedFormat { .. } | OcrError::PageOutOfRange { .. }
        )
    }
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::Page::error`]; the page itself carries empty
/// text and zero confidence.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page could not be rendered to an image.
    #[error("Page {page}: rendering failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The engine exited nonzero or was unavailable.
    #[error("Page {page}: recognition failed: {detail}")]
    RecognitionFailed { page: usize, detail: String },

    /// The engine call exceeded the configured timeout and was killed.
    #[error("Page {page}: recognition timed out after {secs}s")]
    RecognitionTimeout { page: usize, secs: u64 },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::RecognitionFailed { page, .. }
            | PageError::RecognitionTimeout { page, .. } => *page,
        }
    }
}
