//! # edgequake-ocr
//!
//! Turn scanned documents, raster images and PDFs into machine-readable text.
//!
//! ## Why this crate?
//!
//! Many PDFs already carry a text layer; many others are nothing but page
//! scans. This crate treats both alike: pages with embedded text are read
//! directly, and only the pages without it are rendered, cleaned up and
//! handed to a recognition engine. Pages run in parallel on a bounded worker
//! pool, and the result always comes back in page order.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input       detect PDF vs PNG/JPEG/TIFF/BMP from magic bytes
//!  ├─ 2. Source      page count, text layer, render via pdfium
//!  ├─ 3. Preprocess  grayscale → binarize → denoise → deskew → upscale
//!  ├─ 4. Recognize   tesseract, trained data chosen by accuracy tier
//!  ├─ 5. Aggregate   sort pages, assemble Document, report progress
//!  └─ 6. Archive     (conversion-only) zip of page images or texts
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{extract_document, AccuracyTier, DocumentRequest, OcrConfig, OcrPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = OcrPipeline::new(OcrConfig::default());
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let request = DocumentRequest::new("scan.pdf", bytes).with_accuracy(AccuracyTier::Best);
//!     let document = extract_document(&pipeline, request).await?;
//!     println!("{}", document.text());
//!     eprintln!("{} pages in {}", document.page_count, document.runtime());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scan2txt` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-ocr = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing an Accuracy Tier
//!
//! | Tier | Trained data | Speed | Best for |
//! |------|--------------|-------|----------|
//! | `Fast` | `tessdata_fast` | ★★★ | Clean scans, bulk work |
//! | `Balanced` | `tessdata` | ★★ | Default; general documents |
//! | `Best` | `tessdata_best` | ★ | Noisy scans where every word counts |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AccuracyTier, DeskewMethod, OcrConfig, OcrConfigBuilder, PageImageFormat, PreprocessOptions, RenderOptions,
    TesseractSettings, TrainedDataProfiles,
};
pub use convert::{
    convert_pdf_page_to_image, convert_pdf_to_images, convert_pdfs_to_images, extract_document,
    extract_document_sync, extract_pdf_page, extract_source, extract_to_file, pdf_page_count, recognize_image,
    recognize_images_to_archive, DocumentRequest,
};
pub use error::{OcrError, PageError};
pub use output::{Archive, Document, ImageText, Page};
pub use pipeline::coordinator::{CancellationToken, JobContext, OcrPipeline};
pub use pipeline::recognize::{EngineFactory, Recognition, RecognitionEngine, RecognitionError};
pub use pipeline::source::PageSource;
pub use progress::{ChannelProgressSink, NoopProgressSink, ProgressEvent, ProgressReporter, ProgressSink, ProgressStatus};
pub use stream::{extract_stream, stream_source, PageStream};
