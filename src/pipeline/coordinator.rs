//! Page fan-out: run every page of a source through the per-page pipeline.
//!
//! ```text
//!              ┌─▶ page 1 ─▶ text layer? ──yes──▶ Page (confidence 100)
//!  source ─────┼─▶ page 2 ─▶ render ─▶ preprocess ─▶ engine ─▶ Page
//!  (N pages)   └─▶ page N ─▶ ...
//!                       │
//!                       ▼  buffer_unordered(concurrency)
//!                  completion order ──▶ progress ──▶ sort ──▶ Vec<Page>
//! ```
//!
//! Each page runs start to finish on one blocking worker thread and produces
//! exactly one [`Page`]. Workers share nothing mutable: results are moved
//! out through the stream, so there is no shared result list to lock. A
//! failure on one page becomes a degraded `Page` and never stops the others.

use crate::config::{AccuracyTier, OcrConfig};
use crate::error::{OcrError, PageError};
use crate::output::Page;
use crate::pipeline::preprocess::preprocess;
use crate::pipeline::recognize::{EngineFactory, EnginePool, TesseractFactory};
use crate::pipeline::source::PageSource;
use crate::pipeline::text::{clean_text, visible_chars};
use crate::progress::ProgressReporter;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared between a caller and a running job.
///
/// Once cancelled, no further pages are submitted; pages already in flight
/// finish and release their resources, and the job reports
/// [`OcrError::CancellationRequested`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request settings that travel with a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub accuracy: AccuracyTier,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(accuracy: AccuracyTier) -> Self {
        Self {
            accuracy,
            progress: ProgressReporter::silent(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new(AccuracyTier::default())
    }
}

/// Configuration plus the engine pool. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct OcrPipeline {
    config: Arc<OcrConfig>,
    engines: Arc<EnginePool>,
}

impl OcrPipeline {
    /// A pipeline backed by the `tesseract` executable.
    pub fn new(config: OcrConfig) -> Self {
        let factory = Arc::new(TesseractFactory::from_config(&config));
        Self::with_engine_factory(config, factory)
    }

    /// A pipeline backed by any engine implementation.
    pub fn with_engine_factory(config: OcrConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let engines = Arc::new(EnginePool::new(factory, config.max_idle_engines));
        Self {
            config: Arc::new(config),
            engines,
        }
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    pub fn engines(&self) -> &Arc<EnginePool> {
        &self.engines
    }

    /// Process every page of `source`, returning pages sorted by number.
    pub async fn run(&self, source: Arc<dyn PageSource>, ctx: &JobContext) -> Result<Vec<Page>, OcrError> {
        let total = source.page_count();
        let every = self.config.progress_every.max(1);
        info!(total, tier = %ctx.accuracy, concurrency = self.config.concurrency, "Processing pages");

        let mut pages = Vec::with_capacity(total);
        let mut completed = std::pin::pin!(self.page_stream(source, ctx));
        while let Some(result) = completed.next().await {
            pages.push(result?);
            let done = pages.len();
            if done % every == 0 || done == total {
                ctx.progress.info(format!("converted {done} of {total} pages"));
            }
        }

        if pages.len() < total && ctx.cancel.is_cancelled() {
            info!(done = pages.len(), total, "Job cancelled");
            return Err(OcrError::CancellationRequested);
        }

        pages.sort_by_key(|p| p.number);
        Ok(pages)
    }

    /// Pages of `source` in completion order.
    ///
    /// At most `concurrency` pages are in flight. Cancelling `ctx.cancel`
    /// stops submission; the stream then ends after in-flight pages finish.
    pub(crate) fn page_stream(
        &self,
        source: Arc<dyn PageSource>,
        ctx: &JobContext,
    ) -> impl Stream<Item = Result<Page, OcrError>> + Send + 'static {
        let total = source.page_count();
        let tier = ctx.accuracy;
        let cancel = ctx.cancel.clone();
        let config = Arc::clone(&self.config);
        let engines = Arc::clone(&self.engines);

        stream::iter(1..=total)
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(move |number| {
                let source = Arc::clone(&source);
                let config = Arc::clone(&config);
                let engines = Arc::clone(&engines);
                async move {
                    tokio::task::spawn_blocking(move || {
                        process_page(source.as_ref(), number, tier, &config, &engines)
                    })
                    .await
                    .map_err(|e| OcrError::Internal(format!("page {number} worker failed: {e}")))
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
    }
}

impl std::fmt::Debug for OcrPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrPipeline")
            .field("config", &self.config)
            .field("engines", &self.engines)
            .finish()
    }
}

/// The whole per-page pipeline. Blocking; always yields a `Page`.
pub(crate) fn process_page(
    source: &dyn PageSource,
    number: usize,
    tier: AccuracyTier,
    config: &OcrConfig,
    engines: &Arc<EnginePool>,
) -> Page {
    let start = Instant::now();

    match source.text_layer(number) {
        Ok(Some(text)) if visible_chars(&text) >= config.min_text_layer_chars => {
            debug!(page = number, "Using embedded text layer");
            return Page::from_text_layer(number, clean_text(&text), start.elapsed());
        }
        Ok(_) => {}
        Err(e) => warn!(page = number, error = %e, "Text layer unreadable; falling back to OCR"),
    }

    let raw = match source.render(number) {
        Ok(image) => image,
        Err(e) => {
            warn!(page = number, error = %e, "Render failed");
            let error = PageError::RenderFailed {
                page: number,
                detail: e.to_string(),
            };
            return Page::degraded(number, error, start.elapsed());
        }
    };

    let prepared = preprocess(&raw, &config.preprocess);
    drop(raw);
    if prepared.degraded {
        debug!(page = number, "Recognising unprocessed grayscale");
    }

    let mut engine = match engines.checkout(tier) {
        Ok(engine) => engine,
        Err(e) => {
            warn!(page = number, error = %e, "No engine available");
            let error = PageError::RecognitionFailed {
                page: number,
                detail: e.to_string(),
            };
            return Page::degraded(number, error, start.elapsed());
        }
    };

    match engine.recognize(&prepared.image) {
        Ok(recognition) => {
            debug!(
                page = number,
                confidence = recognition.confidence,
                skew = prepared.skew_degrees,
                "Page recognised"
            );
            Page::recognized(number, recognition.text, recognition.confidence, start.elapsed())
        }
        Err(e) => {
            warn!(page = number, error = %e, "Recognition failed");
            Page::degraded(number, e.into_page_error(number), start.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::recognize::{Recognition, RecognitionEngine, RecognitionError};
    use crate::pipeline::source::RasterSource;
    use image::{DynamicImage, GrayImage};

    struct Echo;

    impl RecognitionEngine for Echo {
        fn recognize(&mut self, image: &GrayImage) -> Result<Recognition, RecognitionError> {
            Ok(Recognition {
                text: format!("{}x{}", image.width(), image.height()),
                confidence: 88.0,
            })
        }
    }

    struct EchoFactory;

    impl EngineFactory for EchoFactory {
        fn create(&self, _tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError> {
            Ok(Box::new(Echo))
        }
    }

    struct NoEngines;

    impl EngineFactory for NoEngines {
        fn create(&self, tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError> {
            Err(OcrError::EngineUnavailable {
                detail: format!("no {tier} data"),
            })
        }
    }

    fn raster() -> Arc<dyn PageSource> {
        Arc::new(RasterSource::from_image(
            "blank.png",
            DynamicImage::ImageLuma8(GrayImage::from_pixel(40, 30, image::Luma([255]))),
        ))
    }

    fn quick_config() -> OcrConfig {
        let mut config = OcrConfig::builder().concurrency(2).build().unwrap();
        config.preprocess.upscale = false;
        config
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn raster_page_goes_through_engine() {
        let pipeline = OcrPipeline::with_engine_factory(quick_config(), Arc::new(EchoFactory));
        let pages = pipeline.run(raster(), &JobContext::default()).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].applied_ocr);
        assert_eq!(pages[0].text, "40x30");
        assert_eq!(pages[0].confidence, 88.0);
    }

    #[tokio::test]
    async fn unavailable_engine_degrades_the_page() {
        let pipeline = OcrPipeline::with_engine_factory(quick_config(), Arc::new(NoEngines));
        let pages = pipeline.run(raster(), &JobContext::default()).await.unwrap();
        assert!(matches!(
            pages[0].error,
            Some(PageError::RecognitionFailed { page: 1, .. })
        ));
        assert_eq!(pages[0].text, "");
    }

    #[tokio::test]
    async fn cancelled_before_start_submits_nothing() {
        let pipeline = OcrPipeline::with_engine_factory(quick_config(), Arc::new(EchoFactory));
        let ctx = JobContext::default();
        ctx.cancel.cancel();
        let err = pipeline.run(raster(), &ctx).await.unwrap_err();
        assert!(matches!(err, OcrError::CancellationRequested));
    }
}
