//! Streaming extraction API: emit pages as they complete.
//!
//! Unlike [`crate::convert::extract_document`], which returns only after all
//! pages finish, [`extract_stream`] yields each [`Page`] as soon as its worker
//! is done. Pages arrive in completion order; sort by `number` if order
//! matters.
//!
//! Cancelling the request's token stops new pages from being submitted. The
//! pages already in flight are still yielded; if the document was not
//! finished the stream then ends with `Err(OcrError::CancellationRequested)`
//! and a `Failed` progress event. The stream ends after its first error.

use crate::convert::{open_request, DocumentRequest};
use crate::error::OcrError;
use crate::output::{format_runtime, Page};
use crate::pipeline::coordinator::{JobContext, OcrPipeline};
use crate::pipeline::source::PageSource;
use crate::progress::{ProgressReporter, ProgressStatus};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of pages.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<Page, OcrError>> + Send>>;

/// Bookkeeping carried between items of the outer stream.
struct StreamState {
    pages: PageStream,
    done: usize,
    total: usize,
    every: usize,
    progress: ProgressReporter,
    start: Instant,
}

impl StreamState {
    fn page_done(&mut self) {
        self.done += 1;
        let (done, total) = (self.done, self.total);
        if done % self.every == 0 || done == total {
            self.progress.info(format!("converted {done} of {total} pages"));
        }
        if done == total {
            self.progress.send(
                ProgressStatus::Finished,
                format!("Total processing time: {}", format_runtime(self.start.elapsed())),
            );
        }
    }
}

/// Open a document and stream its pages.
///
/// # Returns
/// - `Ok(PageStream)`: one item per page, in completion order. A cancelled
///   or failed run ends with a single `Err` item.
/// - `Err(OcrError)`: fatal error before any page was started (unsupported
///   input, unreadable PDF)
///
/// # Example
/// ```rust,no_run
/// use edgequake_ocr::{extract_stream, DocumentRequest, OcrConfig, OcrPipeline};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = OcrPipeline::new(OcrConfig::default());
/// let bytes = std::fs::read("scan.pdf")?;
/// let mut pages = extract_stream(&pipeline, DocumentRequest::new("scan.pdf", bytes)).await?;
/// while let Some(page) = pages.next().await {
///     let page = page?;
///     println!("page {}: {} chars", page.number, page.text.len());
/// }
/// # Ok(())
/// # }
/// ```
pub async fn extract_stream(pipeline: &OcrPipeline, request: DocumentRequest) -> Result<PageStream, OcrError> {
    let ctx = request.context();
    let DocumentRequest { filename, bytes, .. } = request;
    info!(filename = %filename, tier = %ctx.accuracy, "Starting streaming extraction");

    let source = open_request(pipeline, bytes, &filename)
        .await
        .inspect_err(|e| ctx.progress.send(ProgressStatus::Failed, e.to_string()))?;
    Ok(stream_source(pipeline, source, &filename, &ctx))
}

/// Stream the pages of an already opened [`PageSource`].
///
/// Publishes the same events as [`extract_stream`] once the document is open.
pub fn stream_source(pipeline: &OcrPipeline, source: Arc<dyn PageSource>, filename: &str, ctx: &JobContext) -> PageStream {
    let start = Instant::now();
    let total = source.page_count();
    ctx.progress
        .info(format!("Starting text extraction of document {filename}"));

    let state = StreamState {
        pages: Box::pin(pipeline.page_stream(source, ctx)),
        done: 0,
        total,
        every: pipeline.config().progress_every.max(1),
        progress: ctx.progress.clone(),
        start,
    };

    // A `None` state ends the outer stream on the next poll.
    let pages = stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        match state.pages.next().await {
            Some(Ok(page)) => {
                state.page_done();
                Some((Ok(page), Some(state)))
            }
            Some(Err(e)) => {
                state.progress.send(ProgressStatus::Failed, e.to_string());
                Some((Err(e), None))
            }
            None if state.done < state.total => {
                warn!(done = state.done, total = state.total, "Streaming extraction cancelled");
                let err = OcrError::CancellationRequested;
                state.progress.send(ProgressStatus::Failed, err.to_string());
                Some((Err(err), None))
            }
            None => None,
        }
    });

    Box::pin(pages)
}
