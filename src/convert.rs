//! Request-level entry points.
//!
//! Each function covers one kind of request: whole-document extraction,
//! single PDF page, single image, batches of images, and the conversion-only
//! requests that turn PDFs into page images. They wait for all work and
//! return the finished result; use [`crate::stream::extract_stream`] to get
//! pages as they complete instead.
//!
//! Input is validated before any work starts: a file of the wrong kind is
//! rejected before a worker is spawned or a scratch directory exists.

use crate::config::{AccuracyTier, OcrConfig, PageImageFormat, RenderOptions};
use crate::error::OcrError;
use crate::output::{Archive, Document, ImageText, Page};
use crate::pipeline::aggregate::assemble;
use crate::pipeline::archive::{build_archive, ArchiveEntry};
use crate::pipeline::coordinator::{process_page, CancellationToken, JobContext, OcrPipeline};
use crate::pipeline::encode;
use crate::pipeline::input::{file_stem, require_image, require_pdf, InputKind, RasterFormat};
use crate::pipeline::preprocess::preprocess;
use crate::pipeline::recognize::Recognition;
use crate::pipeline::render::PdfSource;
use crate::pipeline::source::{open_source, PageSource, RasterSource};
use crate::progress::{ProgressHandle, ProgressReporter, ProgressStatus};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// A whole-document extraction request.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub accuracy: AccuracyTier,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl DocumentRequest {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            accuracy: AccuracyTier::default(),
            progress: ProgressReporter::silent(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_accuracy(mut self, accuracy: AccuracyTier) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Publish progress to `sink`, tagged with `connection_id`.
    pub fn with_progress(mut self, sink: ProgressHandle, connection_id: impl Into<String>) -> Self {
        self.progress = ProgressReporter::new(sink, connection_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn context(&self) -> JobContext {
        JobContext::new(self.accuracy)
            .with_progress(self.progress.clone())
            .with_cancel(self.cancel.clone())
    }
}

// ── Documents ────────────────────────────────────────────────────────────────

/// Extract the text of a PDF or raster image.
///
/// Pages with an embedded text layer are used as-is; the rest are rendered,
/// preprocessed and recognised. Page failures are recorded on the page and
/// do not fail the request.
///
/// # Errors
/// - [`OcrError::UnsupportedFormat`] for input that is neither PDF nor a
///   supported image
/// - [`OcrError::ExtractionFailure`] when the page count cannot be read
/// - [`OcrError::CancellationRequested`] when `request.cancel` fired first
///
/// Every error is also published to the request's progress sink with status
/// [`ProgressStatus::Failed`].
pub async fn extract_document(pipeline: &OcrPipeline, request: DocumentRequest) -> Result<Document, OcrError> {
    let ctx = request.context();
    let DocumentRequest { filename, bytes, .. } = request;
    info!(filename = %filename, tier = %ctx.accuracy, bytes = bytes.len(), "Starting extraction");

    let source = match open_request(pipeline, bytes, &filename).await {
        Ok(source) => source,
        Err(e) => {
            ctx.progress.send(ProgressStatus::Failed, e.to_string());
            return Err(e);
        }
    };
    extract_source(pipeline, source, &filename, &ctx).await
}

/// Run the document pipeline over an already opened [`PageSource`].
///
/// Publishes the start, per-page, extracted and finished (or failed) events.
pub async fn extract_source(
    pipeline: &OcrPipeline,
    source: Arc<dyn PageSource>,
    filename: &str,
    ctx: &JobContext,
) -> Result<Document, OcrError> {
    ctx.progress
        .info(format!("Starting text extraction of document {filename}"));

    let result = run_document(pipeline, source, filename, ctx).await;
    match &result {
        Ok(document) => match serde_json::to_string(document) {
            Ok(json) => {
                ctx.progress.send(ProgressStatus::Extracted, json);
                ctx.progress.send(
                    ProgressStatus::Finished,
                    format!("Total processing time: {}", document.runtime()),
                );
            }
            Err(e) => {
                let e = OcrError::Internal(format!("cannot serialise document: {e}"));
                ctx.progress.send(ProgressStatus::Failed, e.to_string());
                return Err(e);
            }
        },
        Err(e) => ctx.progress.send(ProgressStatus::Failed, e.to_string()),
    }
    result
}

async fn run_document(
    pipeline: &OcrPipeline,
    source: Arc<dyn PageSource>,
    filename: &str,
    ctx: &JobContext,
) -> Result<Document, OcrError> {
    let start = Instant::now();
    let page_count = source.page_count();
    let pages = pipeline.run(source, ctx).await?;
    assemble(filename, page_count, pages, start.elapsed(), ctx.accuracy)
}

/// Extract a document and write its text to `output_path`.
///
/// Uses an atomic write (temp file + rename) so readers never see a
/// partial file.
pub async fn extract_to_file(
    pipeline: &OcrPipeline,
    request: DocumentRequest,
    output_path: impl AsRef<Path>,
) -> Result<Document, OcrError> {
    let document = extract_document(pipeline, request).await?;
    let path = output_path.as_ref();
    let write_err = |source| OcrError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("txt.tmp");
    tokio::fs::write(&tmp_path, document.text()).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    Ok(document)
}

/// Synchronous wrapper around [`extract_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_document_sync(pipeline: &OcrPipeline, request: DocumentRequest) -> Result<Document, OcrError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| OcrError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(extract_document(pipeline, request))
}

/// Text of a single PDF page, from its text layer or by OCR.
pub async fn extract_pdf_page(
    pipeline: &OcrPipeline,
    bytes: Vec<u8>,
    filename: &str,
    page: usize,
    accuracy: AccuracyTier,
) -> Result<Page, OcrError> {
    require_pdf(&bytes, filename)?;
    let source = open_blocking(bytes, filename, InputKind::Pdf, &pipeline.config().render).await?;
    let total = source.page_count();
    if page == 0 || page > total {
        return Err(OcrError::PageOutOfRange { page, total });
    }

    let pipeline = pipeline.clone();
    tokio::task::spawn_blocking(move || {
        process_page(source.as_ref(), page, accuracy, pipeline.config(), pipeline.engines())
    })
    .await
    .map_err(join_error)
}

// ── Images ───────────────────────────────────────────────────────────────────

/// Recognise a single raster image.
///
/// Unlike document pages, a recognition failure here fails the request:
/// there is no other page to fall back on.
pub async fn recognize_image(
    pipeline: &OcrPipeline,
    bytes: Vec<u8>,
    filename: &str,
    accuracy: AccuracyTier,
) -> Result<ImageText, OcrError> {
    let start = Instant::now();
    let format = require_image(&bytes, filename)?;

    let worker = pipeline.clone();
    let name = filename.to_string();
    let recognition = tokio::task::spawn_blocking(move || {
        recognize_raster(&worker, &bytes, &name, format, accuracy)
    })
    .await
    .map_err(join_error)??;

    Ok(ImageText {
        filename: filename.to_string(),
        text: recognition.text,
        confidence: recognition.confidence,
        elapsed: start.elapsed(),
    })
}

/// Recognise many images and pack one `.txt` per image into a zip.
///
/// Entries follow input order and are labelled with the source file stem.
/// All inputs are validated first; after that a failure on one image is
/// logged and yields an empty text entry.
pub async fn recognize_images_to_archive(
    pipeline: &OcrPipeline,
    files: Vec<(String, Vec<u8>)>,
    accuracy: AccuracyTier,
) -> Result<Archive, OcrError> {
    if files.is_empty() {
        return Err(OcrError::ArchiveError("no images supplied".to_string()));
    }
    let mut jobs = Vec::with_capacity(files.len());
    for (index, (filename, bytes)) in files.into_iter().enumerate() {
        let format = require_image(&bytes, &filename)?;
        jobs.push((index, filename, bytes, format));
    }
    let total = jobs.len();
    info!(files = total, tier = %accuracy, "Recognising image batch");

    let mut texts: Vec<(usize, String, String)> = stream::iter(jobs)
        .map(|(index, filename, bytes, format)| {
            let worker = pipeline.clone();
            async move {
                let name = filename.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    recognize_raster(&worker, &bytes, &name, format, accuracy)
                })
                .await
                .map_err(join_error)
                .and_then(|r| r);
                let text = match outcome {
                    Ok(recognition) => recognition.text,
                    Err(e) => {
                        warn!(filename = %filename, error = %e, "Image recognition failed; empty entry");
                        String::new()
                    }
                };
                (index, filename, text)
            }
        })
        .buffer_unordered(pipeline.config().concurrency.max(1))
        .collect()
        .await;
    texts.sort_by_key(|(index, _, _)| *index);

    let entries: Vec<ArchiveEntry> = texts
        .into_iter()
        .map(|(_, filename, text)| ArchiveEntry::new("txt", text.into_bytes()).labelled(file_stem(&filename)))
        .collect();
    let bytes = build_archive("text", &entries)?;

    Ok(Archive {
        file_name: "text.zip".to_string(),
        entry_count: entries.len(),
        bytes,
    })
}

/// Decode, preprocess and recognise one image. Blocking.
fn recognize_raster(
    pipeline: &OcrPipeline,
    bytes: &[u8],
    filename: &str,
    format: RasterFormat,
    accuracy: AccuracyTier,
) -> Result<Recognition, OcrError> {
    let source = RasterSource::decode(bytes, filename, format)?;
    let raw = source.render(1)?;
    let prepared = preprocess(&raw, &pipeline.config().preprocess);
    drop(raw);

    let mut engine = pipeline.engines().checkout(accuracy)?;
    engine
        .recognize(&prepared.image)
        .map_err(|e| OcrError::RecognitionFailure {
            filename: filename.to_string(),
            detail: e.to_string(),
        })
}

// ── Conversion only ──────────────────────────────────────────────────────────

/// Number of pages in a PDF.
pub async fn pdf_page_count(bytes: Vec<u8>, filename: &str, config: &OcrConfig) -> Result<usize, OcrError> {
    require_pdf(&bytes, filename)?;
    let source = open_blocking(bytes, filename, InputKind::Pdf, &config.render).await?;
    Ok(source.page_count())
}

/// Render every page of a PDF and pack the images into a zip.
pub async fn convert_pdf_to_images(
    bytes: Vec<u8>,
    filename: &str,
    format: PageImageFormat,
    config: &OcrConfig,
) -> Result<Archive, OcrError> {
    require_pdf(&bytes, filename)?;
    let name = filename.to_string();
    let render = config.render.clone();
    tokio::task::spawn_blocking(move || pdf_to_archive(bytes, &name, format, render))
        .await
        .map_err(join_error)?
}

/// Render one page of a PDF as an encoded image.
pub async fn convert_pdf_page_to_image(
    bytes: Vec<u8>,
    filename: &str,
    page: usize,
    format: PageImageFormat,
    config: &OcrConfig,
) -> Result<Vec<u8>, OcrError> {
    require_pdf(&bytes, filename)?;
    let name = filename.to_string();
    let render = config.render.clone();
    tokio::task::spawn_blocking(move || {
        let source = PdfSource::open(bytes, &name, render)?;
        encode_rendered(&source, &name, page, format)
    })
    .await
    .map_err(join_error)?
}

/// Convert many PDFs; the result holds one inner zip per PDF, in input order.
pub async fn convert_pdfs_to_images(
    files: Vec<(String, Vec<u8>)>,
    format: PageImageFormat,
    config: &OcrConfig,
) -> Result<Archive, OcrError> {
    if files.is_empty() {
        return Err(OcrError::ArchiveError("no documents supplied".to_string()));
    }
    for (filename, bytes) in &files {
        require_pdf(bytes, filename)?;
    }

    let mut archives: Vec<(usize, String, Result<Archive, OcrError>)> =
        stream::iter(files.into_iter().enumerate())
            .map(|(index, (filename, bytes))| {
                let render = config.render.clone();
                async move {
                    let stem = file_stem(&filename);
                    let result =
                        tokio::task::spawn_blocking(move || pdf_to_archive(bytes, &filename, format, render))
                            .await
                            .map_err(join_error)
                            .and_then(|r| r);
                    (index, stem, result)
                }
            })
            .buffer_unordered(config.concurrency.max(1))
            .collect()
            .await;
    archives.sort_by_key(|(index, _, _)| *index);

    let mut entries = Vec::with_capacity(archives.len());
    for (_, stem, archive) in archives {
        entries.push(ArchiveEntry::new("zip", archive?.bytes).labelled(stem));
    }
    let bytes = build_archive("images", &entries)?;

    Ok(Archive {
        file_name: "images.zip".to_string(),
        entry_count: entries.len(),
        bytes,
    })
}

fn pdf_to_archive(
    bytes: Vec<u8>,
    filename: &str,
    format: PageImageFormat,
    render: RenderOptions,
) -> Result<Archive, OcrError> {
    let source = PdfSource::open(bytes, filename, render)?;
    let mut entries = Vec::with_capacity(source.page_count());
    for page in 1..=source.page_count() {
        entries.push(ArchiveEntry::new(
            format.extension(),
            encode_rendered(&source, filename, page, format)?,
        ));
    }

    let stem = file_stem(filename);
    let bytes = build_archive(&stem, &entries)?;
    debug!(filename, pages = entries.len(), "PDF converted to images");
    Ok(Archive {
        file_name: format!("{stem}_images.zip"),
        entry_count: entries.len(),
        bytes,
    })
}

fn encode_rendered(
    source: &dyn PageSource,
    filename: &str,
    page: usize,
    format: PageImageFormat,
) -> Result<Vec<u8>, OcrError> {
    let image = source.render(page)?;
    encode::encode_page(&image, format).map_err(|e| OcrError::ExtractionFailure {
        filename: filename.to_string(),
        detail: format!("page {page}: image encoding failed: {e}"),
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Detect and open request bytes as a page source.
pub(crate) async fn open_request(
    pipeline: &OcrPipeline,
    bytes: Vec<u8>,
    filename: &str,
) -> Result<Arc<dyn PageSource>, OcrError> {
    let kind = InputKind::detect(&bytes, filename)?;
    open_blocking(bytes, filename, kind, &pipeline.config().render).await
}

async fn open_blocking(
    bytes: Vec<u8>,
    filename: &str,
    kind: InputKind,
    render: &RenderOptions,
) -> Result<Arc<dyn PageSource>, OcrError> {
    let name = filename.to_string();
    let render = render.clone();
    tokio::task::spawn_blocking(move || open_source(bytes, &name, kind, &render))
        .await
        .map_err(join_error)?
}

fn join_error(e: JoinError) -> OcrError {
    OcrError::Internal(format!("worker task failed: {e}"))
}
