//! Pipeline integration tests.
//!
//! These run the full coordinator, aggregator and archive path against
//! scripted recognition engines and in-memory page sources, so neither
//! pdfium nor tesseract is needed.

use edgequake_ocr::pipeline::scratch::{leftover_dirs, ScratchDir};
use edgequake_ocr::{
    convert_pdf_to_images, extract_document, extract_pdf_page, extract_source, extract_stream, pdf_page_count,
    recognize_image, recognize_images_to_archive, stream_source, AccuracyTier, CancellationToken, ChannelProgressSink, Document,
    DocumentRequest, EngineFactory, JobContext, OcrConfig, OcrError, OcrPipeline, PageError, PageImageFormat,
    PageSource, ProgressEvent, ProgressReporter, ProgressSink, ProgressStatus, Recognition, RecognitionEngine,
    RecognitionError,
};
use futures::StreamExt;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Page widths encode the page number: `WIDTH_BASE + n`.
const WIDTH_BASE: u32 = 100;

#[derive(Clone, Copy)]
enum FakePage {
    Text(&'static str),
    Scan,
    Broken,
}

struct FakeDocument {
    pages: Vec<FakePage>,
}

impl FakeDocument {
    fn new(pages: Vec<FakePage>) -> Arc<dyn PageSource> {
        Arc::new(Self { pages })
    }

    fn scans(n: usize) -> Arc<dyn PageSource> {
        Self::new(vec![FakePage::Scan; n])
    }
}

impl PageSource for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn text_layer(&self, page: usize) -> Result<Option<String>, OcrError> {
        match self.pages[page - 1] {
            FakePage::Text(text) => Ok(Some(text.to_string())),
            _ => Ok(None),
        }
    }

    fn render(&self, page: usize) -> Result<DynamicImage, OcrError> {
        match self.pages[page - 1] {
            FakePage::Broken => Err(OcrError::ExtractionFailure {
                filename: "fake.pdf".into(),
                detail: format!("page {page} is corrupt"),
            }),
            _ => Ok(blank(WIDTH_BASE + page as u32, 60)),
        }
    }
}

fn blank(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([255])))
}

fn png(width: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    blank(width, 40)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[derive(Clone, Copy)]
enum Script {
    /// Echo the page number decoded from the image width.
    Echo,
    /// Echo after a delay that varies per page.
    Jittered,
    /// Echo after holding a scratch directory for a while.
    SlowWithScratch,
    Fail,
    TimeOut,
    /// Echo, but bring the worker thread down on one page.
    PanicOn(u32),
}

struct ScriptedEngine {
    script: Script,
    scratch_root: PathBuf,
    calls: Arc<AtomicUsize>,
}

impl RecognitionEngine for ScriptedEngine {
    fn recognize(&mut self, image: &GrayImage) -> Result<Recognition, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = image.width().saturating_sub(WIDTH_BASE);
        let echo = Recognition {
            text: format!("scanned page {n}"),
            confidence: 80.0 + (n % 10) as f32,
        };
        match self.script {
            Script::Echo => Ok(echo),
            Script::Jittered => {
                std::thread::sleep(Duration::from_millis(((n * 7) % 13) as u64));
                Ok(echo)
            }
            Script::SlowWithScratch => {
                let scratch = ScratchDir::create(&self.scratch_root).map_err(|e| RecognitionError::Failed {
                    detail: e.to_string(),
                })?;
                scratch.create_file("png", b"page").unwrap();
                std::thread::sleep(Duration::from_millis(40));
                Ok(echo)
            }
            Script::Fail => Err(RecognitionError::Failed {
                detail: "engine crashed".into(),
            }),
            Script::TimeOut => Err(RecognitionError::TimedOut { secs: 3 }),
            Script::PanicOn(page) if page == n => panic!("engine aborted on page {n}"),
            Script::PanicOn(_) => Ok(echo),
        }
    }
}

struct ScriptedFactory {
    script: Script,
    scratch_root: PathBuf,
    created: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, _tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            script: self.script,
            scratch_root: self.scratch_root.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct Harness {
    pipeline: OcrPipeline,
    factory: Arc<ScriptedFactory>,
    scratch: tempfile::TempDir,
}

fn harness(script: Script, concurrency: usize) -> Harness {
    harness_with(script, |b| b.concurrency(concurrency))
}

fn harness_with(
    script: Script,
    configure: impl FnOnce(edgequake_ocr::OcrConfigBuilder) -> edgequake_ocr::OcrConfigBuilder,
) -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = configure(OcrConfig::builder().scratch_root(scratch.path()))
        .build()
        .unwrap();
    config.preprocess.upscale = false;

    let factory = Arc::new(ScriptedFactory {
        script,
        scratch_root: scratch.path().to_path_buf(),
        created: AtomicUsize::new(0),
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let pipeline = OcrPipeline::with_engine_factory(config, factory.clone());
    Harness {
        pipeline,
        factory,
        scratch,
    }
}

fn numbers(document: &Document) -> Vec<usize> {
    document.pages.iter().map(|p| p.number).collect()
}

// ── Documents ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn mixed_text_layer_and_scanned_pages() {
    let h = harness(Script::Echo, 4);
    let source = FakeDocument::new(vec![
        FakePage::Text("Introduction\n\n  \nfirst page"),
        FakePage::Scan,
        FakePage::Text("third page"),
        FakePage::Scan,
        FakePage::Text("fifth page   "),
    ]);

    let doc = extract_source(&h.pipeline, source, "mixed.pdf", &JobContext::default())
        .await
        .unwrap();

    assert_eq!(doc.page_count, 5);
    assert_eq!(numbers(&doc), vec![1, 2, 3, 4, 5]);
    assert_eq!(doc.text_layer_pages(), 3);
    assert_eq!(doc.ocr_pages(), 2);

    let flags: Vec<bool> = doc.pages.iter().map(|p| p.applied_ocr).collect();
    assert_eq!(flags, vec![false, true, false, true, false]);
    assert_eq!(doc.pages[0].text, "Introduction\nfirst page");
    assert_eq!(doc.pages[0].confidence, 100.0);
    assert_eq!(doc.pages[1].text, "scanned page 2");
    assert_eq!(doc.pages[3].text, "scanned page 4");
    assert_eq!(doc.pages[4].text, "fifth page");
    assert_eq!(h.factory.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pages_come_back_in_order_whatever_finishes_first() {
    let h = harness(Script::Jittered, 8);
    let doc = extract_source(&h.pipeline, FakeDocument::scans(40), "long.pdf", &JobContext::default())
        .await
        .unwrap();

    assert_eq!(numbers(&doc), (1..=40).collect::<Vec<_>>());
    for page in &doc.pages {
        assert_eq!(page.text, format!("scanned page {}", page.number));
        assert!((0.0..=100.0).contains(&page.confidence));
    }
}

#[tokio::test]
async fn page_failures_do_not_fail_the_document() {
    let h = harness(Script::Echo, 2);
    let source = FakeDocument::new(vec![FakePage::Scan, FakePage::Broken, FakePage::Text("ok")]);
    let doc = extract_source(&h.pipeline, source, "partly-broken.pdf", &JobContext::default())
        .await
        .unwrap();

    assert_eq!(doc.degraded_pages(), 1);
    let broken = &doc.pages[1];
    assert_eq!(broken.text, "");
    assert_eq!(broken.confidence, 0.0);
    assert!(matches!(broken.error, Some(PageError::RenderFailed { page: 2, .. })));
    assert_eq!(doc.text(), "scanned page 1\n\nok");
}

#[tokio::test]
async fn engine_failures_are_recorded_per_page() {
    let h = harness(Script::Fail, 2);
    let doc = extract_source(&h.pipeline, FakeDocument::scans(3), "x.pdf", &JobContext::default())
        .await
        .unwrap();
    assert_eq!(doc.degraded_pages(), 3);
    assert!(doc
        .pages
        .iter()
        .all(|p| matches!(&p.error, Some(PageError::RecognitionFailed { detail, .. }) if detail == "engine crashed")));
}

#[tokio::test]
async fn timed_out_pages_are_marked_and_engines_replaced() {
    let h = harness(Script::TimeOut, 1);
    let doc = extract_source(&h.pipeline, FakeDocument::scans(3), "slow.pdf", &JobContext::default())
        .await
        .unwrap();
    assert!(doc
        .pages
        .iter()
        .all(|p| matches!(p.error, Some(PageError::RecognitionTimeout { secs: 3, .. }))));
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 3);
    assert_eq!(h.pipeline.engines().idle_count(AccuracyTier::default()), 0);
}

#[tokio::test]
async fn engines_are_pooled_across_pages() {
    let h = harness_with(Script::Echo, |b| b.concurrency(2).max_idle_engines(2));
    let ctx = JobContext::new(AccuracyTier::Balanced);
    extract_source(&h.pipeline, FakeDocument::scans(12), "pooled.pdf", &ctx)
        .await
        .unwrap();

    let created = h.factory.created.load(Ordering::SeqCst);
    assert!((1..=2).contains(&created), "created {created} engines");
    assert_eq!(h.pipeline.engines().idle_count(AccuracyTier::Balanced), created);
    assert_eq!(h.pipeline.engines().idle_count(AccuracyTier::Fast), 0);
}

#[tokio::test]
async fn repeated_runs_are_identical() {
    let h = harness(Script::Jittered, 4);
    let source = FakeDocument::new(vec![FakePage::Scan, FakePage::Text("a"), FakePage::Scan, FakePage::Scan]);
    let first = extract_source(&h.pipeline, source.clone(), "d.pdf", &JobContext::default())
        .await
        .unwrap();
    let second = extract_source(&h.pipeline, source, "d.pdf", &JobContext::default())
        .await
        .unwrap();

    let texts = |d: &Document| d.pages.iter().map(|p| (p.text.clone(), p.confidence)).collect::<Vec<_>>();
    assert_eq!(texts(&first), texts(&second));
}

// ── Progress ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_follow_the_document_lifecycle() {
    let h = harness(Script::Echo, 3);
    let (sink, events) = ChannelProgressSink::new();
    let ctx = JobContext::default().with_progress(ProgressReporter::new(sink, "conn-42"));

    extract_source(
        &h.pipeline,
        FakeDocument::new(vec![FakePage::Scan, FakePage::Text("t"), FakePage::Scan, FakePage::Scan, FakePage::Scan]),
        "progress.pdf",
        &ctx,
    )
    .await
    .unwrap();
    drop(ctx);

    let events: Vec<ProgressEvent> = events.collect().await;
    assert!(events.iter().all(|e| e.connection_id == "conn-42"));
    assert_eq!(events[0].message, "Starting text extraction of document progress.pdf");

    let converted: Vec<&str> = events
        .iter()
        .filter(|e| e.message.starts_with("converted "))
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(converted.len(), 5);
    assert_eq!(converted.last(), Some(&"converted 5 of 5 pages"));

    let extracted = events
        .iter()
        .find(|e| e.status == ProgressStatus::Extracted)
        .unwrap();
    let doc: Document = serde_json::from_str(&extracted.message).unwrap();
    assert_eq!(doc.page_count, 5);

    let last = events.last().unwrap();
    assert_eq!(last.status, ProgressStatus::Finished);
    assert!(last.message.starts_with("Total processing time: "));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn progress_can_be_batched() {
    let h = harness_with(Script::Echo, |b| b.concurrency(2).progress_every(2));
    let (sink, events) = ChannelProgressSink::new();
    let ctx = JobContext::default().with_progress(ProgressReporter::new(sink, "batch"));

    extract_source(&h.pipeline, FakeDocument::scans(5), "b.pdf", &ctx)
        .await
        .unwrap();
    drop(ctx);

    let converted: Vec<String> = events
        .filter(|e| futures::future::ready(e.message.starts_with("converted ")))
        .map(|e| e.message)
        .collect()
        .await;
    assert_eq!(
        converted,
        vec![
            "converted 2 of 5 pages",
            "converted 4 of 5 pages",
            "converted 5 of 5 pages"
        ]
    );
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cancels the job as soon as the first page completes.
struct CancelOnFirstPage {
    token: CancellationToken,
    failed: AtomicUsize,
}

impl ProgressSink for CancelOnFirstPage {
    fn publish(&self, event: ProgressEvent) {
        if event.message.starts_with("converted ") {
            self.token.cancel();
        }
        if event.status == ProgressStatus::Failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn cancellation_discards_results_and_leaves_no_scratch() {
    let h = harness(Script::SlowWithScratch, 2);
    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnFirstPage {
        token: token.clone(),
        failed: AtomicUsize::new(0),
    });
    let ctx = JobContext::default()
        .with_progress(ProgressReporter::new(sink.clone(), "cancel"))
        .with_cancel(token);

    let err = extract_source(&h.pipeline, FakeDocument::scans(30), "big.pdf", &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, OcrError::CancellationRequested));
    assert!(h.factory.calls.load(Ordering::SeqCst) < 30);
    assert_eq!(sink.failed.load(Ordering::SeqCst), 1);
    assert!(leftover_dirs(h.scratch.path()).is_empty());
}

// ── Input validation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_only_requests_reject_images_before_any_scratch_exists() {
    let root = tempfile::tempdir().unwrap();
    let scratch_root = root.path().join("scratch");
    let config = OcrConfig::builder().scratch_root(&scratch_root).build().unwrap();
    let pipeline = OcrPipeline::new(config.clone());

    let err = pdf_page_count(png(10), "picture.png", &config).await.unwrap_err();
    assert!(matches!(err, OcrError::UnsupportedFormat { .. }));

    let err = convert_pdf_to_images(png(10), "disguised.pdf", PageImageFormat::Png, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::UnsupportedFormat { .. }));

    let err = extract_pdf_page(&pipeline, png(10), "picture.png", 1, AccuracyTier::Fast)
        .await
        .unwrap_err();
    assert!(err.is_input_error());

    assert!(!scratch_root.exists());
}

#[tokio::test]
async fn unsupported_documents_publish_a_failed_event() {
    let h = harness(Script::Echo, 1);
    let (sink, events) = ChannelProgressSink::new();
    let request = DocumentRequest::new("notes.txt", b"plain text".to_vec()).with_progress(sink, "c");

    let err = extract_document(&h.pipeline, request).await.unwrap_err();
    assert!(matches!(err, OcrError::UnsupportedFormat { .. }));

    let events: Vec<ProgressEvent> = events.collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, ProgressStatus::Failed);
}

// ── Images ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_documents_are_single_pages() {
    let h = harness(Script::Echo, 2);
    let request = DocumentRequest::new("receipt.png", png(WIDTH_BASE + 1)).with_accuracy(AccuracyTier::Best);
    let doc = extract_document(&h.pipeline, request).await.unwrap();

    assert_eq!(doc.page_count, 1);
    assert_eq!(doc.accuracy, AccuracyTier::Best);
    assert!(doc.pages[0].applied_ocr);
    assert_eq!(doc.text(), "scanned page 1");
}

#[tokio::test]
async fn single_image_recognition() {
    let h = harness(Script::Echo, 1);
    let result = recognize_image(&h.pipeline, png(WIDTH_BASE + 7), "card.png", AccuracyTier::Fast)
        .await
        .unwrap();
    assert_eq!(result.filename, "card.png");
    assert_eq!(result.text, "scanned page 7");
    assert_eq!(result.confidence, 87.0);
}

#[tokio::test]
async fn single_image_failure_is_fatal() {
    let h = harness(Script::Fail, 1);
    let err = recognize_image(&h.pipeline, png(120), "card.png", AccuracyTier::Fast)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::RecognitionFailure { .. }));
}

#[tokio::test]
async fn image_batches_are_archived_in_input_order() {
    let h = harness(Script::Jittered, 3);
    let files: Vec<(String, Vec<u8>)> = (1..=11)
        .map(|i| (format!("scan{i}.png"), png(WIDTH_BASE + i)))
        .collect();

    let archive = recognize_images_to_archive(&h.pipeline, files, AccuracyTier::Fast)
        .await
        .unwrap();
    assert_eq!(archive.entry_count, 11);

    let mut zip = zip::ZipArchive::new(Cursor::new(archive.bytes)).unwrap();
    let mut names = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, format!("scanned page {}", i + 1));
        names.push(entry.name().to_string());
    }
    assert_eq!(names[0], "text-01-scan1.txt");
    assert_eq!(names[10], "text-11-scan11.txt");

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(sorted, names);
}

#[tokio::test]
async fn image_batch_failures_become_empty_entries() {
    let h = harness(Script::Fail, 2);
    let files = vec![("a.png".to_string(), png(101)), ("b.png".to_string(), png(102))];
    let archive = recognize_images_to_archive(&h.pipeline, files, AccuracyTier::Fast)
        .await
        .unwrap();
    let mut zip = zip::ZipArchive::new(Cursor::new(archive.bytes)).unwrap();
    assert_eq!(zip.len(), 2);
    assert_eq!(zip.by_index(0).unwrap().size(), 0);
}

#[tokio::test]
async fn image_batches_validate_every_input() {
    let h = harness(Script::Echo, 2);
    let files = vec![("a.png".to_string(), png(101)), ("b.pdf".to_string(), b"%PDF-1.4".to_vec())];
    let err = recognize_images_to_archive(&h.pipeline, files, AccuracyTier::Fast)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::UnsupportedFormat { .. }));
    assert_eq!(h.factory.calls.load(Ordering::SeqCst), 0);
}

// ── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_yields_every_page() {
    let h = harness(Script::Echo, 2);
    let (sink, events) = ChannelProgressSink::new();
    let request = DocumentRequest::new("photo.png", png(WIDTH_BASE + 1)).with_progress(sink, "s");

    let pages: Vec<_> = extract_stream(&h.pipeline, request)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].as_ref().unwrap().text, "scanned page 1");

    let events: Vec<ProgressEvent> = events.collect().await;
    assert_eq!(events.last().unwrap().status, ProgressStatus::Finished);
}

#[tokio::test]
async fn streaming_a_cancelled_request_ends_with_an_error() {
    let h = harness(Script::Echo, 2);
    let token = CancellationToken::new();
    token.cancel();
    let (sink, events) = ChannelProgressSink::new();
    let request = DocumentRequest::new("photo.png", png(WIDTH_BASE + 1))
        .with_progress(sink, "s")
        .with_cancel(token);

    let items: Vec<_> = extract_stream(&h.pipeline, request)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(OcrError::CancellationRequested)));
    assert_eq!(h.factory.calls.load(Ordering::SeqCst), 0);

    let events: Vec<ProgressEvent> = events.collect().await;
    assert_eq!(events.last().unwrap().status, ProgressStatus::Failed);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn streaming_cancelled_mid_run_keeps_finished_pages_then_fails() {
    let h = harness(Script::SlowWithScratch, 2);
    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnFirstPage {
        token: token.clone(),
        failed: AtomicUsize::new(0),
    });
    let ctx = JobContext::default()
        .with_progress(ProgressReporter::new(sink.clone(), "cancel"))
        .with_cancel(token);

    let items: Vec<_> = stream_source(&h.pipeline, FakeDocument::scans(30), "big.pdf", &ctx)
        .collect()
        .await;

    let (last, pages) = items.split_last().unwrap();
    assert!(matches!(last, Err(OcrError::CancellationRequested)));
    assert!(!pages.is_empty() && pages.len() < 30);
    assert!(pages.iter().all(|p| p.is_ok()));
    assert_eq!(sink.failed.load(Ordering::SeqCst), 1);
    assert!(leftover_dirs(h.scratch.path()).is_empty());
}

#[tokio::test]
async fn streaming_stops_at_the_first_error() {
    let h = harness(Script::PanicOn(3), 1);
    let (sink, events) = ChannelProgressSink::new();
    let ctx = JobContext::default().with_progress(ProgressReporter::new(sink, "s"));

    let items: Vec<_> = stream_source(&h.pipeline, FakeDocument::scans(6), "six.pdf", &ctx)
        .collect()
        .await;
    drop(ctx);

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().number, 1);
    assert_eq!(items[1].as_ref().unwrap().number, 2);
    assert!(matches!(items[2], Err(OcrError::Internal(_))));

    let events: Vec<ProgressEvent> = events.collect().await;
    let terminal: Vec<ProgressStatus> = events.iter().filter(|e| e.is_terminal()).map(|e| e.status).collect();
    assert_eq!(terminal, vec![ProgressStatus::Failed]);
    assert_eq!(events.last().unwrap().status, ProgressStatus::Failed);
}
