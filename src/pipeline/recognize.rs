//! Text recognition: the engine seam, the Tesseract adapter and the pool.
//!
//! ## Engines
//!
//! [`RecognitionEngine`] turns one preprocessed page into text plus a mean
//! confidence. Engines are created by an [`EngineFactory`] for a specific
//! [`AccuracyTier`]; everything an engine needs (executable, language,
//! trained-data directory, timeout) is handed to it at construction, so two
//! tiers can be served side by side without touching process-global state.
//!
//! ## Tesseract
//!
//! [`TesseractEngine`] drives the `tesseract` executable. Each call writes
//! the page into its own [`ScratchDir`], runs the process with a hard
//! deadline and parses the TSV report. A process that outlives the deadline
//! is killed and reported as [`RecognitionError::TimedOut`].
//!
//! ## Pool
//!
//! [`EnginePool`] keeps idle engines per tier. A checked-out engine is
//! returned automatically when its [`PooledEngine`] guard drops; an engine
//! that timed out is discarded instead of being reused.

use crate::config::{AccuracyTier, OcrConfig, TesseractSettings};
use crate::error::{OcrError, PageError};
use crate::pipeline::scratch::ScratchDir;
use crate::pipeline::text::clean_text;
use image::{GrayImage, ImageFormat};
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Text and mean word confidence for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Mean word confidence in `[0, 100]`; 0 when no words were found.
    pub confidence: f32,
}

/// Why an engine call produced nothing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecognitionError {
    #[error("{detail}")]
    Failed { detail: String },

    #[error("engine did not finish within {secs}s")]
    TimedOut { secs: u64 },
}

impl RecognitionError {
    pub fn into_page_error(self, page: usize) -> PageError {
        match self {
            RecognitionError::Failed { detail } => PageError::RecognitionFailed { page, detail },
            RecognitionError::TimedOut { secs } => PageError::RecognitionTimeout { page, secs },
        }
    }
}

/// One recognition engine instance.
///
/// Calls are blocking and may take seconds; they run on worker threads.
pub trait RecognitionEngine: Send {
    fn recognize(&mut self, image: &GrayImage) -> Result<Recognition, RecognitionError>;
}

/// Builds engines for a tier.
pub trait EngineFactory: Send + Sync {
    /// Fails with [`OcrError::EngineUnavailable`] when the tier cannot be
    /// served on this host.
    fn create(&self, tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError>;
}

// ── Tesseract ────────────────────────────────────────────────────────────────

/// Creates [`TesseractEngine`]s from explicit settings.
#[derive(Debug, Clone)]
pub struct TesseractFactory {
    settings: TesseractSettings,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl TesseractFactory {
    pub fn new(settings: TesseractSettings, scratch_root: PathBuf, timeout: Duration) -> Self {
        Self {
            settings,
            scratch_root,
            timeout,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(
            config.tesseract.clone(),
            config.scratch_root.clone(),
            Duration::from_secs(config.recognition_timeout_secs),
        )
    }

    fn check_executable(&self) -> Result<String, OcrError> {
        let output = Command::new(&self.settings.executable)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| OcrError::EngineUnavailable {
                detail: match e.kind() {
                    ErrorKind::NotFound => format!(
                        "executable '{}' not found",
                        self.settings.executable.display()
                    ),
                    _ => format!("cannot run '{}': {e}", self.settings.executable.display()),
                },
            })?;

        // Older releases print the banner on stderr.
        let banner = if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        Ok(String::from_utf8_lossy(banner)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

impl EngineFactory for TesseractFactory {
    fn create(&self, tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError> {
        let tessdata = self.settings.profiles.path(tier).to_path_buf();
        if !tessdata.is_dir() {
            return Err(OcrError::EngineUnavailable {
                detail: format!(
                    "trained data for tier '{tier}' not found at {}",
                    tessdata.display()
                ),
            });
        }

        let version = self.check_executable()?;
        info!(%tier, %version, tessdata = %tessdata.display(), "Recognition engine ready");

        Ok(Box::new(TesseractEngine {
            settings: self.settings.clone(),
            tessdata,
            scratch_root: self.scratch_root.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Runs the `tesseract` executable once per page.
#[derive(Debug)]
pub struct TesseractEngine {
    settings: TesseractSettings,
    tessdata: PathBuf,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl TesseractEngine {
    /// The engine invocation for one page. Trained data is pinned for the
    /// child only, both by flag and by `TESSDATA_PREFIX`; the parent
    /// environment is never touched.
    fn command(&self, input: &Path, out_base: &Path) -> Command {
        let mut command = Command::new(&self.settings.executable);
        command
            .arg(input)
            .arg(out_base)
            .arg("--tessdata-dir")
            .arg(&self.tessdata)
            .arg("-l")
            .arg(&self.settings.language)
            .arg("--oem")
            .arg(self.settings.oem.to_string())
            .arg("--psm")
            .arg(self.settings.psm.to_string())
            .arg("--dpi")
            .arg(self.settings.dpi.to_string())
            .arg("tsv")
            .env("TESSDATA_PREFIX", &self.tessdata)
            .env("OMP_THREAD_LIMIT", self.settings.thread_limit.to_string());
        command
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(&mut self, image: &GrayImage) -> Result<Recognition, RecognitionError> {
        let failed = |detail: String| RecognitionError::Failed { detail };

        let scratch = ScratchDir::create(&self.scratch_root).map_err(|e| failed(e.to_string()))?;
        let input = scratch.new_temp_file_name("png");
        image
            .save_with_format(&input, ImageFormat::Png)
            .map_err(|e| failed(format!("cannot write page image: {e}")))?;

        let out_base = scratch.new_temp_file_name("");
        let stderr_path = scratch.path().join("stderr.log");
        let stderr = File::create(&stderr_path).map_err(|e| failed(format!("cannot create log: {e}")))?;

        let mut child = self
            .command(&input, &out_base)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| failed(format!("cannot start engine: {e}")))?;

        let started = Instant::now();
        let status = wait_with_timeout(&mut child, self.timeout)
            .map_err(|e| failed(format!("lost track of engine process: {e}")))?;
        let Some(status) = status else {
            warn!(timeout_secs = self.timeout.as_secs(), "Engine process killed");
            return Err(RecognitionError::TimedOut {
                secs: self.timeout.as_secs(),
            });
        };

        if !status.success() {
            let log = std::fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(failed(format!("engine exited with {status}: {}", log.trim())));
        }

        let mut report = out_base.into_os_string();
        report.push(".tsv");
        let tsv = std::fs::read_to_string(&report)
            .map_err(|e| failed(format!("engine produced no report: {e}")))?;

        let recognition = parse_tsv(&tsv);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = recognition.text.len(),
            confidence = recognition.confidence,
            "Engine call finished"
        );
        Ok(recognition)
    }
}

/// Wait for `child`, killing it once `timeout` has passed.
///
/// Returns `Ok(None)` when the process had to be killed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                // Exited between the last poll and the kill.
                debug!(error = %e, "Kill after deadline failed");
            }
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Rebuild text and mean confidence from a Tesseract TSV report.
///
/// Word rows (level 5) are joined with spaces inside a line and with
/// newlines between lines. Rows without text are ignored, as are negative
/// confidences, which mark non-word boxes.
pub fn parse_tsv(tsv: &str) -> Recognition {
    let mut text = String::new();
    let mut current_line: Option<(&str, &str, &str)> = None;
    let mut conf_sum = 0.0_f64;
    let mut conf_words = 0usize;

    for row in tsv.lines() {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let line_key = (cols[2], cols[3], cols[4]);
        match current_line {
            Some(key) if key == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(line_key);
        text.push_str(word);

        if let Ok(conf) = cols[10].trim().parse::<f64>() {
            if conf >= 0.0 {
                conf_sum += conf;
                conf_words += 1;
            }
        }
    }

    let confidence = if conf_words == 0 {
        0.0
    } else {
        (conf_sum / conf_words as f64).clamp(0.0, 100.0) as f32
    };

    Recognition {
        text: clean_text(&text),
        confidence,
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Idle engines keyed by tier.
pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    idle: Mutex<HashMap<AccuracyTier, Vec<Box<dyn RecognitionEngine>>>>,
    max_idle_per_tier: usize,
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, max_idle_per_tier: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_tier,
        }
    }

    /// Take an idle engine for `tier`, or create one.
    pub fn checkout(self: &Arc<Self>, tier: AccuracyTier) -> Result<PooledEngine, OcrError> {
        let reused = self.lock().get_mut(&tier).and_then(Vec::pop);
        let engine = match reused {
            Some(engine) => engine,
            None => {
                debug!(%tier, "Creating recognition engine");
                self.factory.create(tier)?
            }
        };
        Ok(PooledEngine {
            pool: Arc::clone(self),
            tier,
            engine: Some(engine),
            discard: false,
        })
    }

    /// Engines currently idle for `tier`.
    pub fn idle_count(&self, tier: AccuracyTier) -> usize {
        self.lock().get(&tier).map_or(0, Vec::len)
    }

    fn checkin(&self, tier: AccuracyTier, engine: Box<dyn RecognitionEngine>) {
        let mut idle = self.lock();
        let slot = idle.entry(tier).or_default();
        if slot.len() < self.max_idle_per_tier {
            slot.push(engine);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AccuracyTier, Vec<Box<dyn RecognitionEngine>>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle: HashMap<AccuracyTier, usize> =
            self.lock().iter().map(|(tier, engines)| (*tier, engines.len())).collect();
        f.debug_struct("EnginePool")
            .field("idle", &idle)
            .field("max_idle_per_tier", &self.max_idle_per_tier)
            .finish()
    }
}

/// An engine on loan from an [`EnginePool`].
pub struct PooledEngine {
    pool: Arc<EnginePool>,
    tier: AccuracyTier,
    engine: Option<Box<dyn RecognitionEngine>>,
    discard: bool,
}

impl PooledEngine {
    pub fn tier(&self) -> AccuracyTier {
        self.tier
    }

    pub fn recognize(&mut self, image: &GrayImage) -> Result<Recognition, RecognitionError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(RecognitionError::Failed {
                detail: "engine already returned to pool".to_string(),
            });
        };
        let result = engine.recognize(image);
        if matches!(result, Err(RecognitionError::TimedOut { .. })) {
            self.discard = true;
        }
        result
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if self.discard {
                debug!(tier = %self.tier, "Discarding engine after timeout");
            } else {
                self.pool.checkin(self.tier, engine);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn word(block: u32, par: u32, line: u32, conf: &str, text: &str) -> String {
        format!("5\t1\t{block}\t{par}\t{line}\t1\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn tsv_words_are_grouped_into_lines() {
        let tsv = [
            HEADER.to_string(),
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t".to_string(),
            word(1, 1, 1, "90", "Hello"),
            word(1, 1, 1, "80", "world"),
            word(1, 1, 2, "70.5", "second"),
            word(2, 1, 1, "60", "next"),
        ]
        .join("\n");
        let r = parse_tsv(&tsv);
        assert_eq!(r.text, "Hello world\nsecond\nnext");
        assert!((r.confidence - 75.125).abs() < 1e-3);
    }

    #[test]
    fn empty_words_and_negative_conf_are_skipped() {
        let tsv = [
            HEADER.to_string(),
            word(1, 1, 1, "-1", " "),
            word(1, 1, 1, "-1", "odd"),
            word(1, 1, 1, "50", "ok"),
        ]
        .join("\n");
        let r = parse_tsv(&tsv);
        assert_eq!(r.text, "odd ok");
        assert_eq!(r.confidence, 50.0);
    }

    #[test]
    fn blank_report_has_zero_confidence() {
        let r = parse_tsv(HEADER);
        assert_eq!(r.text, "");
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn timeout_maps_to_page_error() {
        let e = RecognitionError::TimedOut { secs: 7 }.into_page_error(4);
        assert_eq!(e, PageError::RecognitionTimeout { page: 4, secs: 7 });
    }

    #[test]
    fn missing_executable_is_unavailable() {
        let profiles_root = tempfile::tempdir().unwrap();
        let settings = TesseractSettings {
            executable: PathBuf::from("/nonexistent/bin/tesseract-missing"),
            profiles: crate::config::TrainedDataProfiles {
                fast: profiles_root.path().to_path_buf(),
                balanced: profiles_root.path().to_path_buf(),
                best: profiles_root.path().to_path_buf(),
            },
            ..TesseractSettings::default()
        };
        let factory = TesseractFactory::new(settings, std::env::temp_dir(), Duration::from_secs(5));
        let err = factory.create(AccuracyTier::Fast).err().unwrap();
        assert!(matches!(err, OcrError::EngineUnavailable { .. }), "{err}");
    }

    #[test]
    fn missing_profile_is_unavailable() {
        let settings = TesseractSettings {
            profiles: crate::config::TrainedDataProfiles::under("/nonexistent/tessdata-root"),
            ..TesseractSettings::default()
        };
        let factory = TesseractFactory::new(settings, std::env::temp_dir(), Duration::from_secs(5));
        let err = factory.create(AccuracyTier::Best).err().unwrap();
        assert!(err.to_string().contains("tessdata_best"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn overdue_process_is_killed() {
        let mut child = Command::new("sleep").arg("10").spawn().unwrap();
        let started = Instant::now();
        let status = wait_with_timeout(&mut child, Duration::from_millis(200)).unwrap();
        assert!(status.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn quick_process_reports_status() {
        let mut child = Command::new("true").spawn().unwrap();
        let status = wait_with_timeout(&mut child, Duration::from_secs(10)).unwrap();
        assert!(status.unwrap().success());
    }

    struct Fixed {
        outcome: Result<Recognition, RecognitionError>,
    }

    impl RecognitionEngine for Fixed {
        fn recognize(&mut self, _image: &GrayImage) -> Result<Recognition, RecognitionError> {
            self.outcome.clone()
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
        outcome: Result<Recognition, RecognitionError>,
    }

    impl EngineFactory for CountingFactory {
        fn create(&self, _tier: AccuracyTier) -> Result<Box<dyn RecognitionEngine>, OcrError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Fixed {
                outcome: self.outcome.clone(),
            }))
        }
    }

    fn pool_with(outcome: Result<Recognition, RecognitionError>, max_idle: usize) -> (Arc<EnginePool>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            outcome,
        });
        (Arc::new(EnginePool::new(factory.clone(), max_idle)), factory)
    }

    #[test]
    fn engines_are_reused_per_tier() {
        let (pool, factory) = pool_with(
            Ok(Recognition {
                text: "x".into(),
                confidence: 90.0,
            }),
            4,
        );
        let page = GrayImage::new(1, 1);
        for _ in 0..3 {
            let mut engine = pool.checkout(AccuracyTier::Fast).unwrap();
            engine.recognize(&page).unwrap();
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(AccuracyTier::Fast), 1);

        let _best = pool.checkout(AccuracyTier::Best).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(AccuracyTier::Best), 0);
    }

    #[test]
    fn timed_out_engines_are_discarded() {
        let (pool, factory) = pool_with(Err(RecognitionError::TimedOut { secs: 1 }), 4);
        {
            let mut engine = pool.checkout(AccuracyTier::Balanced).unwrap();
            assert!(engine.recognize(&GrayImage::new(1, 1)).is_err());
        }
        assert_eq!(pool.idle_count(AccuracyTier::Balanced), 0);
        let _again = pool.checkout(AccuracyTier::Balanced).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_engines_are_capped() {
        let (pool, _) = pool_with(Err(RecognitionError::Failed { detail: "x".into() }), 1);
        let a = pool.checkout(AccuracyTier::Fast).unwrap();
        let b = pool.checkout(AccuracyTier::Fast).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(AccuracyTier::Fast), 1);
    }

    #[test]
    fn engine_command_scopes_trained_data_to_the_child() {
        use std::ffi::OsStr;

        let engine = TesseractEngine {
            settings: TesseractSettings {
                language: "eng+deu".into(),
                thread_limit: 2,
                ..TesseractSettings::default()
            },
            tessdata: PathBuf::from("/opt/tess/tessdata_best"),
            scratch_root: std::env::temp_dir(),
            timeout: Duration::from_secs(5),
        };
        let command = engine.command(Path::new("/scratch/IN.png"), Path::new("/scratch/OUT"));

        assert_eq!(command.get_program(), OsStr::new("tesseract"));
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(
            args,
            [
                "/scratch/IN.png",
                "/scratch/OUT",
                "--tessdata-dir",
                "/opt/tess/tessdata_best",
                "-l",
                "eng+deu",
                "--oem",
                "1",
                "--psm",
                "1",
                "--dpi",
                "300",
                "tsv"
            ]
            .map(OsStr::new)
        );

        let envs: HashMap<&OsStr, Option<&OsStr>> = command.get_envs().collect();
        assert_eq!(envs[OsStr::new("TESSDATA_PREFIX")], Some(OsStr::new("/opt/tess/tessdata_best")));
        assert_eq!(envs[OsStr::new("OMP_THREAD_LIMIT")], Some(OsStr::new("2")));
    }
}
