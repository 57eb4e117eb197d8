//! Configuration types for the OCR pipeline.
//!
//! Every knob lives in [`OcrConfig`], built via [`OcrConfigBuilder`]. The
//! config is a plain value: it is handed explicitly to each engine at
//! construction time and never read back from process-global state, so two
//! concurrent requests with different accuracy tiers cannot interfere.
//!
//! Nested sections group settings by pipeline stage:
//!
//! | Section | Stage |
//! |---------|-------|
//! | [`RenderOptions`] | PDF rasterisation |
//! | [`PreprocessOptions`] | grayscale / binarize / denoise / deskew / upscale |
//! | [`TesseractSettings`] | recognition engine invocation |

use crate::error::OcrError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the OCR pipeline.
///
/// # Example
/// ```rust
/// use edgequake_ocr::{OcrConfig, AccuracyTier};
///
/// let config = OcrConfig::builder()
///     .concurrency(4)
///     .language("eng+por")
///     .recognition_timeout_secs(60)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// assert!(config.tesseract.profiles.path(AccuracyTier::Best).ends_with("tessdata_best"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Maximum pages (or files) in flight at once. Default: 80 % of the
    /// available CPU parallelism, rounded up, at least 1.
    ///
    /// Every in-flight page occupies one blocking thread for its whole
    /// lifetime (render, preprocess, engine call), so this is also the
    /// number of worker threads the pipeline keeps busy.
    pub concurrency: usize,

    /// Upper bound for a single engine call in seconds. Default: 120.
    ///
    /// On expiry the engine process is killed and the page is recorded as
    /// [`crate::error::PageError::RecognitionTimeout`].
    pub recognition_timeout_secs: u64,

    /// Emit a "converted X of N pages" progress event every this many
    /// completed pages. The last page always emits. Default: 1.
    pub progress_every: usize,

    /// Minimum non-whitespace characters for a PDF text layer to be used
    /// instead of OCR. Default: 1.
    pub min_text_layer_chars: usize,

    /// Parent directory for per-call scratch directories. Default: the
    /// system temp dir.
    pub scratch_root: PathBuf,

    /// Idle engines kept per accuracy tier between tasks. Default: the
    /// concurrency level.
    pub max_idle_engines: usize,

    pub render: RenderOptions,
    pub preprocess: PreprocessOptions,
    pub tesseract: TesseractSettings,
}

impl Default for OcrConfig {
    fn default() -> Self {
        let concurrency = default_concurrency();
        Self {
            concurrency,
            recognition_timeout_secs: 120,
            progress_every: 1,
            min_text_layer_chars: 1,
            scratch_root: std::env::temp_dir(),
            max_idle_engines: concurrency,
            render: RenderOptions::default(),
            preprocess: PreprocessOptions::default(),
            tesseract: TesseractSettings::default(),
        }
    }
}

impl OcrConfig {
    /// Create a new builder for `OcrConfig`.
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }
}

/// `ceil(available_parallelism × 0.8)`, never below 1.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cpus as f64 * 0.8).ceil() as usize).max(1)
}

/// Builder for [`OcrConfig`].
#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn recognition_timeout_secs(mut self, secs: u64) -> Self {
        self.config.recognition_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_every(mut self, n: usize) -> Self {
        self.config.progress_every = n.max(1);
        self
    }

    pub fn min_text_layer_chars(mut self, n: usize) -> Self {
        self.config.min_text_layer_chars = n;
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = dir.into();
        self
    }

    pub fn max_idle_engines(mut self, n: usize) -> Self {
        self.config.max_idle_engines = n;
        self
    }

    pub fn render(mut self, render: RenderOptions) -> Self {
        self.config.render = render;
        self
    }

    pub fn preprocess(mut self, preprocess: PreprocessOptions) -> Self {
        self.config.preprocess = preprocess;
        self
    }

    pub fn tesseract(mut self, settings: TesseractSettings) -> Self {
        self.config.tesseract = settings;
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.render.pdfium_library = Some(path.into());
        self
    }

    pub fn tesseract_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract.executable = path.into();
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.tesseract.language = lang.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.tesseract.dpi = dpi.clamp(70, 1200);
        self
    }

    pub fn page_segmentation_mode(mut self, psm: u8) -> Self {
        self.config.tesseract.psm = psm;
        self
    }

    pub fn engine_mode(mut self, oem: u8) -> Self {
        self.config.tesseract.oem = oem;
        self
    }

    pub fn thread_limit(mut self, n: u32) -> Self {
        self.config.tesseract.thread_limit = n.max(1);
        self
    }

    pub fn profiles(mut self, profiles: TrainedDataProfiles) -> Self {
        self.config.tesseract.profiles = profiles;
        self
    }

    pub fn max_skew_degrees(mut self, degrees: f32) -> Self {
        self.config.preprocess.max_skew_degrees = degrees.clamp(0.0, 45.0);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, OcrError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(OcrError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.tesseract.psm > 13 {
            return Err(OcrError::InvalidConfig(format!(
                "Page segmentation mode must be 0–13, got {}",
                c.tesseract.psm
            )));
        }
        if c.tesseract.oem > 3 {
            return Err(OcrError::InvalidConfig(format!(
                "Engine mode must be 0–3, got {}",
                c.tesseract.oem
            )));
        }
        if c.tesseract.language.trim().is_empty() {
            return Err(OcrError::InvalidConfig("Language must not be empty".into()));
        }
        if c.render.target_width < 100 || c.render.max_rendered_pixels < 100 {
            return Err(OcrError::InvalidConfig(format!(
                "Render size too small: target width {} / max {} px",
                c.render.target_width, c.render.max_rendered_pixels
            )));
        }
        if !(0.0..=45.0).contains(&c.preprocess.max_skew_degrees) {
            return Err(OcrError::InvalidConfig(format!(
                "Max skew must be 0–45°, got {}",
                c.preprocess.max_skew_degrees
            )));
        }
        Ok(self.config)
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// PDF rasterisation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Target page width in pixels. Default: 2480 (A4 at 300 DPI).
    ///
    /// Rendering to a fixed width rather than a fixed DPI keeps recognition
    /// quality consistent across page sizes.
    pub target_width: u32,

    /// Cap on the rendered page height in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Explicit libpdfium location. `None` binds the system library.
    pub pdfium_library: Option<PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            target_width: 2480,
            max_rendered_pixels: 4000,
            pdfium_library: None,
        }
    }
}

/// Image normalisation settings. Every stage can be disabled individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// Adaptive + Otsu binarization.
    pub binarize: bool,
    /// Half-size of the adaptive threshold window. Default: 20 (41×41 px).
    pub block_radius: u32,
    /// Subtracted from the local mean before comparing. Default: 3.
    pub threshold_offset: i32,
    /// Morphological open then close.
    pub denoise: bool,
    pub deskew: bool,
    pub deskew_method: DeskewMethod,
    /// Skew estimates beyond this are treated as intentional. Default: 5°.
    pub max_skew_degrees: f32,
    pub upscale: bool,
    /// Pages whose longer edge is below this are scaled up. Default: 1800.
    pub min_long_edge: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            binarize: true,
            block_radius: 20,
            threshold_offset: 3,
            denoise: true,
            deskew: true,
            deskew_method: DeskewMethod::default(),
            max_skew_degrees: 5.0,
            upscale: true,
            min_long_edge: 1800,
        }
    }
}

/// Settings for the `tesseract` executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesseractSettings {
    /// Executable name or path. Default: `tesseract` (resolved via `PATH`).
    pub executable: PathBuf,
    /// Language(s), e.g. `eng` or `eng+por`. Default: `eng`.
    pub language: String,
    /// OCR engine mode (`--oem`). Default: 1 (LSTM only).
    pub oem: u8,
    /// Page segmentation mode (`--psm`). Default: 1 (automatic with
    /// orientation and script detection).
    pub psm: u8,
    /// Resolution hint (`--dpi`). Default: 300.
    pub dpi: u32,
    /// `OMP_THREAD_LIMIT` for each engine process. Default: 1.
    ///
    /// Parallelism comes from running pages side by side; letting every
    /// engine process also spawn OpenMP threads oversubscribes the CPU.
    pub thread_limit: u32,
    pub profiles: TrainedDataProfiles,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            oem: 1,
            psm: 1,
            dpi: 300,
            thread_limit: 1,
            profiles: TrainedDataProfiles::default(),
        }
    }
}

/// Trained-data directories, one per [`AccuracyTier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainedDataProfiles {
    pub fast: PathBuf,
    pub balanced: PathBuf,
    pub best: PathBuf,
}

impl TrainedDataProfiles {
    /// All three profiles as subdirectories `tessdata_fast`, `tessdata` and
    /// `tessdata_best` of `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            fast: root.join("tessdata_fast"),
            balanced: root.join("tessdata"),
            best: root.join("tessdata_best"),
        }
    }

    /// Directory holding the trained data for `tier`.
    pub fn path(&self, tier: AccuracyTier) -> &Path {
        match tier {
            AccuracyTier::Fast => &self.fast,
            AccuracyTier::Balanced => &self.balanced,
            AccuracyTier::Best => &self.best,
        }
    }
}

impl Default for TrainedDataProfiles {
    fn default() -> Self {
        Self::under("/usr/share/tesseract-ocr/5")
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Trade-off between recognition speed and confidence.
///
/// | Tier | Trained data | Use case |
/// |------|--------------|----------|
/// | Fast | `tessdata_fast` | Bulk triage, clean scans |
/// | Balanced | `tessdata` | General documents (default) |
/// | Best | `tessdata_best` | Noisy scans where accuracy matters most |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyTier {
    Fast,
    #[default]
    Balanced,
    Best,
}

impl AccuracyTier {
    pub const ALL: [AccuracyTier; 3] = [AccuracyTier::Fast, AccuracyTier::Balanced, AccuracyTier::Best];

    pub fn as_str(self) -> &'static str {
        match self {
            AccuracyTier::Fast => "fast",
            AccuracyTier::Balanced => "balanced",
            AccuracyTier::Best => "best",
        }
    }
}

impl std::fmt::Display for AccuracyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the preprocessor estimates the text-line angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeskewMethod {
    /// Minimum-area bounding rectangle of the foreground pixels. (default)
    #[default]
    MinAreaRect,
    /// Median angle of near-horizontal Hough line segments.
    HoughLines,
}

/// Encoding for page images produced by conversion-only requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageImageFormat {
    #[default]
    Png,
    Tiff,
}

impl PageImageFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            PageImageFormat::Png => "png",
            PageImageFormat::Tiff => "tif",
        }
    }

    pub(crate) fn image_format(self) -> image::ImageFormat {
        match self {
            PageImageFormat::Png => image::ImageFormat::Png,
            PageImageFormat::Tiff => image::ImageFormat::Tiff,
        }
    }
}
