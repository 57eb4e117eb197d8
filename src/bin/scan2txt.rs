//! CLI binary for edgequake-ocr.
//!
//! A thin shim over the library crate that maps CLI flags to `OcrConfig`,
//! runs one request and prints or writes the result.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_ocr::{
    convert_pdfs_to_images, extract_document, extract_pdf_page, pdf_page_count, recognize_image,
    recognize_images_to_archive, AccuracyTier, DeskewMethod, DocumentRequest, OcrConfig, OcrError, OcrPipeline,
    PageImageFormat, ProgressEvent, ProgressSink, ProgressStatus, TrainedDataProfiles,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Terminal progress sink: a spinner until the page count is known, then a
/// bar driven by the "converted X of N pages" events.
struct CliProgressSink {
    bar: ProgressBar,
}

impl CliProgressSink {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn activate_bar(&self, total: u64) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Recognising");
        self.bar.reset_eta();
    }
}

impl ProgressSink for CliProgressSink {
    fn publish(&self, event: ProgressEvent) {
        match event.status {
            ProgressStatus::Informational => {
                if let Some((done, total)) = parse_converted(&event.message) {
                    if self.bar.length() != Some(total) {
                        self.activate_bar(total);
                    }
                    self.bar.set_position(done);
                } else {
                    self.bar
                        .println(format!("{} {}", cyan("◆"), bold(&event.message)));
                }
            }
            ProgressStatus::Extracted => {}
            ProgressStatus::Finished => {
                self.bar.finish_and_clear();
                eprintln!("{} {}", green("✔"), event.message);
            }
            ProgressStatus::Failed => {
                self.bar.finish_and_clear();
            }
        }
    }
}

/// `"converted 3 of 10 pages"` → `(3, 10)`.
fn parse_converted(message: &str) -> Option<(u64, u64)> {
    let rest = message.strip_prefix("converted ")?;
    let (done, rest) = rest.split_once(" of ")?;
    let total = rest.strip_suffix(" pages")?;
    Some((done.parse().ok()?, total.parse().ok()?))
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract text from a scanned PDF (stdout)
  scan2txt extract scan.pdf

  # Best accuracy, write to a file
  scan2txt --accuracy best extract noisy-scan.pdf -o scan.txt

  # Full result as JSON (pages, confidence, flags, runtime)
  scan2txt extract --json invoice.png > invoice.json

  # One page of a PDF
  scan2txt page report.pdf 3

  # Page count
  scan2txt count report.pdf

  # OCR a batch of images into a zip of .txt files
  scan2txt images a.png b.jpg c.tif -o texts.zip

  # Render PDFs to page images (no OCR)
  scan2txt to-images a.pdf b.pdf -o pages.zip --format tiff

ACCURACY TIERS:
  Tier       Trained data     Notes
  ─────────  ───────────────  ─────────────────────────────
  fast       tessdata_fast    clean scans, bulk work
  balanced   tessdata         default; general documents
  best       tessdata_best    noisy scans, slowest

ENVIRONMENT VARIABLES:
  OCR_ACCURACY         Default accuracy tier
  OCR_CONCURRENCY      Pages in flight (default: 80% of CPUs)
  OCR_TESSERACT        Path to the tesseract executable
  OCR_TESSDATA_ROOT    Directory holding tessdata_fast/, tessdata/, tessdata_best/
  OCR_LANGUAGE         Recognition language(s), e.g. eng+deu
  OCR_PDFIUM_LIB       Path to libpdfium (default: system library)
  OCR_SCRATCH_DIR      Parent directory for scratch files
  RUST_LOG             Log filter (overrides --verbose/--quiet)

EXIT CODES:
  0  success
  1  processing failed
  2  invalid input (unsupported format, page out of range)
"#;

/// Turn scanned images and PDFs into text.
#[derive(Parser, Debug)]
#[command(
    name = "scan2txt",
    version,
    about = "Turn scanned images and PDFs into text",
    long_about = "Extract text from PDFs and raster images (PNG, JPEG, TIFF, BMP). Pages with an \
embedded text layer are read directly; the rest are deskewed, binarized and recognised with \
tesseract at the chosen accuracy tier.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    engine: EngineArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "OCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "OCR_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "OCR_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the text of a PDF or image.
    Extract {
        input: PathBuf,
        /// Write text to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the full document as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Extract one page of a PDF.
    Page {
        input: PathBuf,
        /// 1-based page number.
        page: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the number of pages of a PDF.
    Count { input: PathBuf },
    /// Recognise a single image.
    Image {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Recognise many images into a zip of .txt files.
    Images {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render PDFs to page images, one inner zip per PDF.
    ToImages {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "png")]
        format: FormatArg,
    },
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Accuracy tier: fast, balanced, best.
    #[arg(long, global = true, env = "OCR_ACCURACY", value_enum, default_value = "balanced")]
    accuracy: AccuracyArg,

    /// Pages (or files) processed in parallel.
    #[arg(short, long, global = true, env = "OCR_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Per-page engine timeout in seconds.
    #[arg(long, global = true, env = "OCR_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Recognition language(s), e.g. eng or eng+por.
    #[arg(long, global = true, env = "OCR_LANGUAGE", default_value = "eng")]
    language: String,

    /// Page segmentation mode (0–13).
    #[arg(long, global = true, env = "OCR_PSM", default_value_t = 1)]
    psm: u8,

    /// OCR engine mode (0–3).
    #[arg(long, global = true, env = "OCR_OEM", default_value_t = 1)]
    oem: u8,

    /// Resolution hint passed to the engine (70–1200).
    #[arg(long, global = true, env = "OCR_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(70..=1200))]
    dpi: u32,

    /// tesseract executable.
    #[arg(long, global = true, env = "OCR_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Directory holding tessdata_fast/, tessdata/ and tessdata_best/.
    #[arg(long, global = true, env = "OCR_TESSDATA_ROOT")]
    tessdata_root: Option<PathBuf>,

    /// Override the trained-data directory of the fast tier.
    #[arg(long, global = true, env = "OCR_TESSDATA_FAST")]
    tessdata_fast: Option<PathBuf>,

    /// Override the trained-data directory of the balanced tier.
    #[arg(long, global = true, env = "OCR_TESSDATA_BALANCED")]
    tessdata_balanced: Option<PathBuf>,

    /// Override the trained-data directory of the best tier.
    #[arg(long, global = true, env = "OCR_TESSDATA_BEST")]
    tessdata_best: Option<PathBuf>,

    /// Path to libpdfium.
    #[arg(long, global = true, env = "OCR_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// Parent directory for scratch files.
    #[arg(long, global = true, env = "OCR_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Skew estimator.
    #[arg(long, global = true, env = "OCR_DESKEW_METHOD", value_enum, default_value = "min-area-rect")]
    deskew_method: DeskewArg,

    /// Largest skew (degrees) that is corrected.
    #[arg(long, global = true, env = "OCR_MAX_SKEW", default_value_t = 5.0)]
    max_skew: f32,

    #[arg(long, global = true)]
    no_deskew: bool,

    #[arg(long, global = true)]
    no_binarize: bool,

    #[arg(long, global = true)]
    no_denoise: bool,

    #[arg(long, global = true)]
    no_upscale: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum AccuracyArg {
    Fast,
    Balanced,
    Best,
}

impl From<AccuracyArg> for AccuracyTier {
    fn from(v: AccuracyArg) -> Self {
        match v {
            AccuracyArg::Fast => AccuracyTier::Fast,
            AccuracyArg::Balanced => AccuracyTier::Balanced,
            AccuracyArg::Best => AccuracyTier::Best,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DeskewArg {
    MinAreaRect,
    Hough,
}

impl From<DeskewArg> for DeskewMethod {
    fn from(v: DeskewArg) -> Self {
        match v {
            DeskewArg::MinAreaRect => DeskewMethod::MinAreaRect,
            DeskewArg::Hough => DeskewMethod::HoughLines,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Tiff,
}

impl From<FormatArg> for PageImageFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png => PageImageFormat::Png,
            FormatArg::Tiff => PageImageFormat::Tiff,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar provides the feedback that matters; keep library
    // logs down to errors while it is showing.
    let show_progress = !cli.quiet && !cli.no_progress && matches!(cli.command, Command::Extract { json: false, .. });
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match run(cli, show_progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", red("✘"));
            let input_error = e
                .downcast_ref::<OcrError>()
                .is_some_and(OcrError::is_input_error);
            ExitCode::from(if input_error { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli, show_progress: bool) -> Result<()> {
    let config = build_config(&cli.engine)?;
    let accuracy: AccuracyTier = cli.engine.accuracy.into();

    match cli.command {
        Command::Extract { input, output, json } => {
            let (filename, bytes) = read_input(&input).await?;
            let pipeline = OcrPipeline::new(config);
            let mut request = DocumentRequest::new(filename, bytes).with_accuracy(accuracy);
            if show_progress {
                request = request.with_progress(CliProgressSink::new(), "cli");
            }

            let document = extract_document(&pipeline, request)
                .await
                .context("Extraction failed")?;

            let rendered = if json {
                serde_json::to_string_pretty(&document).context("Failed to serialise output")?
            } else {
                document.text()
            };
            match output {
                Some(path) => {
                    write_output(&path, rendered.as_bytes()).await?;
                    if !cli.quiet {
                        eprintln!("   →  {}", bold(&path.display().to_string()));
                    }
                }
                None => print_text(&rendered)?,
            }

            if !cli.quiet {
                eprintln!(
                    "{}  {} pages  ({} text layer, {} OCR{})  {}",
                    if document.degraded_pages() == 0 { green("✔") } else { cyan("⚠") },
                    document.page_count,
                    document.text_layer_pages(),
                    document.ocr_pages(),
                    if document.degraded_pages() > 0 {
                        format!(", {}", red(&format!("{} degraded", document.degraded_pages())))
                    } else {
                        String::new()
                    },
                    dim(&document.runtime()),
                );
            }
        }

        Command::Page { input, page, json } => {
            let (filename, bytes) = read_input(&input).await?;
            let pipeline = OcrPipeline::new(config);
            let result = extract_pdf_page(&pipeline, bytes, &filename, page, accuracy)
                .await
                .with_context(|| format!("Failed to extract page {page}"))?;
            if json {
                print_text(&serde_json::to_string_pretty(&result).context("Failed to serialise output")?)?;
            } else {
                print_text(&result.text)?;
            }
            if let Some(error) = &result.error {
                eprintln!("{} {}", cyan("⚠"), error);
            }
        }

        Command::Count { input } => {
            let (filename, bytes) = read_input(&input).await?;
            let count = pdf_page_count(bytes, &filename, &config)
                .await
                .context("Failed to count pages")?;
            println!("{count}");
        }

        Command::Image { input, json } => {
            let (filename, bytes) = read_input(&input).await?;
            let pipeline = OcrPipeline::new(config);
            let result = recognize_image(&pipeline, bytes, &filename, accuracy)
                .await
                .context("Recognition failed")?;
            if json {
                print_text(&serde_json::to_string_pretty(&result).context("Failed to serialise output")?)?;
            } else {
                print_text(&result.text)?;
                if !cli.quiet {
                    eprintln!("{}  confidence {:.1}", green("✔"), result.confidence);
                }
            }
        }

        Command::Images { inputs, output } => {
            let files = read_inputs(&inputs).await?;
            let pipeline = OcrPipeline::new(config);
            let archive = recognize_images_to_archive(&pipeline, files, accuracy)
                .await
                .context("Batch recognition failed")?;
            write_output(&output, &archive.bytes).await?;
            if !cli.quiet {
                eprintln!(
                    "{}  {} entries  →  {}",
                    green("✔"),
                    archive.entry_count,
                    bold(&output.display().to_string())
                );
            }
        }

        Command::ToImages { inputs, output, format } => {
            let files = read_inputs(&inputs).await?;
            let archive = convert_pdfs_to_images(files, format.into(), &config)
                .await
                .context("Conversion failed")?;
            write_output(&output, &archive.bytes).await?;
            if !cli.quiet {
                eprintln!(
                    "{}  {} documents  →  {}",
                    green("✔"),
                    archive.entry_count,
                    bold(&output.display().to_string())
                );
            }
        }
    }

    Ok(())
}

/// Map CLI args to `OcrConfig`.
fn build_config(args: &EngineArgs) -> Result<OcrConfig> {
    let mut profiles = match &args.tessdata_root {
        Some(root) => TrainedDataProfiles::under(root),
        None => TrainedDataProfiles::default(),
    };
    if let Some(p) = &args.tessdata_fast {
        profiles.fast = p.clone();
    }
    if let Some(p) = &args.tessdata_balanced {
        profiles.balanced = p.clone();
    }
    if let Some(p) = &args.tessdata_best {
        profiles.best = p.clone();
    }

    let mut builder = OcrConfig::builder()
        .recognition_timeout_secs(args.timeout)
        .language(args.language.clone())
        .page_segmentation_mode(args.psm)
        .engine_mode(args.oem)
        .dpi(args.dpi)
        .tesseract_executable(args.tesseract.clone())
        .profiles(profiles)
        .max_skew_degrees(args.max_skew);

    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(path) = &args.pdfium_lib {
        builder = builder.pdfium_library(path.clone());
    }
    if let Some(dir) = &args.scratch_dir {
        builder = builder.scratch_root(dir.clone());
    }

    let mut config = builder.build().context("Invalid configuration")?;

    // Stage switches have no builder setters.
    config.preprocess.deskew_method = args.deskew_method.into();
    config.preprocess.deskew = !args.no_deskew;
    config.preprocess.binarize = !args.no_binarize;
    config.preprocess.denoise = !args.no_denoise;
    config.preprocess.upscale = !args.no_upscale;

    Ok(config)
}

async fn read_input(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((filename, bytes))
}

async fn read_inputs(paths: &[PathBuf]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(read_input(path).await?);
    }
    Ok(files)
}

/// Atomic write: temp file, then rename.
async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn print_text(text: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(text.as_bytes())
        .context("Failed to write to stdout")?;
    // Ensure a trailing newline on stdout.
    if !text.ends_with('\n') {
        handle.write_all(b"\n").context("Failed to write to stdout")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converted_messages_are_parsed() {
        assert_eq!(parse_converted("converted 3 of 10 pages"), Some((3, 10)));
        assert_eq!(parse_converted("Starting text extraction of document a.pdf"), None);
        assert_eq!(parse_converted("converted x of 10 pages"), None);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
