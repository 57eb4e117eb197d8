//! Result types handed back to callers.
//!
//! [`Document`] and [`Page`] are plain owned values: workers build a `Page`
//! exactly once and move it into the coordinator, which sorts and wraps them.
//! Nothing here holds buffers or handles that need explicit teardown.

use crate::config::AccuracyTier;
use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Text recognised (or extracted) from one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number.
    pub number: usize,
    /// UTF-8 text with blank-only lines stripped.
    pub text: String,
    /// `true` when the text came from the recognition engine, `false` when it
    /// came from the page's embedded text layer.
    pub applied_ocr: bool,
    /// Mean recognition confidence in `[0, 100]`.
    pub confidence: f32,
    /// Wall-clock time spent on this page.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// Why the page is empty, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl Page {
    /// A page served from its embedded text layer.
    pub fn from_text_layer(number: usize, text: String, elapsed: Duration) -> Self {
        Self {
            number,
            text,
            applied_ocr: false,
            confidence: 100.0,
            elapsed,
            error: None,
        }
    }

    /// A page produced by the recognition engine.
    pub fn recognized(number: usize, text: String, confidence: f32, elapsed: Duration) -> Self {
        Self {
            number,
            text,
            applied_ocr: true,
            confidence: clamp_confidence(confidence),
            elapsed,
            error: None,
        }
    }

    /// An empty, zero-confidence page recording a non-fatal failure.
    pub fn degraded(number: usize, error: PageError, elapsed: Duration) -> Self {
        Self {
            number,
            text: String::new(),
            applied_ocr: true,
            confidence: 0.0,
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// The aggregated result for a whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub page_count: usize,
    pub accuracy: AccuracyTier,
    /// Always sorted by page number, numbers `1..=page_count`.
    pub pages: Vec<Page>,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl Document {
    /// All page texts joined with a blank line.
    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Total runtime as `HH:MM:SS.cc`.
    pub fn runtime(&self) -> String {
        format_runtime(self.elapsed)
    }

    pub fn ocr_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.applied_ocr).count()
    }

    pub fn text_layer_pages(&self) -> usize {
        self.pages.iter().filter(|p| !p.applied_ocr).count()
    }

    pub fn degraded_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_degraded()).count()
    }
}

/// Result of a single-image OCR call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageText {
    pub filename: String,
    pub text: String,
    pub confidence: f32,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

/// A zip archive produced by a conversion-only request.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Suggested download name, e.g. `report_images.zip`.
    pub file_name: String,
    pub entry_count: usize,
    pub bytes: Vec<u8>,
}

/// Format a duration as `HH:MM:SS.cc` (centiseconds).
pub fn format_runtime(d: Duration) -> String {
    let total = d.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60,
        d.subsec_millis() / 10
    )
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 100.0)
    }
}

/// Serialise durations as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_format_matches_hh_mm_ss_cc() {
        assert_eq!(format_runtime(Duration::from_millis(3_723_450)), "01:02:03.45");
        assert_eq!(format_runtime(Duration::ZERO), "00:00:00.00");
    }

    #[test]
    fn confidence_is_clamped() {
        let p = Page::recognized(1, "x".into(), 140.0, Duration::ZERO);
        assert_eq!(p.confidence, 100.0);
        let p = Page::recognized(1, "x".into(), -3.0, Duration::ZERO);
        assert_eq!(p.confidence, 0.0);
        let p = Page::recognized(1, "x".into(), f32::NAN, Duration::ZERO);
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn degraded_page_is_empty() {
        let p = Page::degraded(
            4,
            PageError::RecognitionFailed {
                page: 4,
                detail: "exit 1".into(),
            },
            Duration::from_millis(5),
        );
        assert!(p.text.is_empty());
        assert_eq!(p.confidence, 0.0);
        assert!(p.is_degraded());
    }

    #[test]
    fn document_counts_and_text() {
        let doc = Document {
            filename: "a.pdf".into(),
            page_count: 3,
            accuracy: AccuracyTier::Fast,
            pages: vec![
                Page::from_text_layer(1, "alpha".into(), Duration::ZERO),
                Page::recognized(2, "beta".into(), 91.0, Duration::ZERO),
                Page::degraded(
                    3,
                    PageError::RenderFailed {
                        page: 3,
                        detail: "oom".into(),
                    },
                    Duration::ZERO,
                ),
            ],
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(doc.text(), "alpha\n\nbeta");
        assert_eq!(doc.text_layer_pages(), 1);
        assert_eq!(doc.ocr_pages(), 2);
        assert_eq!(doc.degraded_pages(), 1);
        assert_eq!(doc.runtime(), "00:00:02.00");
    }

    #[test]
    fn page_json_omits_missing_error() {
        let p = Page::recognized(2, "hello".into(), 88.5, Duration::from_millis(1500));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["elapsed"], 1.5);
        assert!(json.get("error").is_none());
        let back: Page = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }
}
