//! Image normalisation ahead of recognition.
//!
//! A stateless, deterministic chain applied to every page that needs OCR:
//!
//! ```text
//! RGB/any ──▶ grayscale ──▶ binarize ──▶ denoise ──▶ deskew ──▶ upscale
//!             (luma8)       (adaptive    (drop tiny  (≤ max     (long edge
//!                            ∧ Otsu)      specks)     skew)      ≥ floor)
//! ```
//!
//! Every stage can fail (empty buffer, oversized upscale) or, in the worst
//! case, panic inside an image routine. Either way the page is not lost: the
//! chain falls back to the plain grayscale buffer and marks the result as
//! degraded.

use crate::config::{DeskewMethod, PreprocessOptions};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Pixels darker than this count as foreground (text).
const FOREGROUND_LEVEL: u8 = 128;
/// Dark components this small are noise, not glyph parts.
const MAX_SPECK_PIXELS: u32 = 2;
/// Skew estimates smaller than this are not worth a resampling pass.
const MIN_CORRECTION_DEGREES: f32 = 0.05;
/// Hard limit on the upscaled buffer.
const MAX_UPSCALED_PIXELS: u64 = 120_000_000;
/// Hough estimation works on a copy no larger than this.
const HOUGH_MAX_EDGE: u32 = 1200;

/// A normalised single-channel page ready for the engine.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub image: GrayImage,
    /// Rotation applied to straighten the page, in degrees.
    pub skew_degrees: f32,
    /// `true` when a stage failed and `image` is plain grayscale.
    pub degraded: bool,
}

/// Why a stage gave up.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("upscaling to {width}x{height} exceeds the pixel limit")]
    UpscaleTooLarge { width: u32, height: u32 },
}

/// Run the full chain. Never fails; see [`Preprocessed::degraded`].
#[instrument(skip_all, fields(width = image.width(), height = image.height()))]
pub fn preprocess(image: &DynamicImage, options: &PreprocessOptions) -> Preprocessed {
    let gray = image.to_luma8();

    match catch_unwind(AssertUnwindSafe(|| run_chain(&gray, options))) {
        Ok(Ok((image, skew_degrees))) => Preprocessed {
            image,
            skew_degrees,
            degraded: false,
        },
        Ok(Err(e)) => {
            warn!(error = %e, "Preprocessing failed; falling back to grayscale");
            fallback(gray)
        }
        Err(_) => {
            warn!("Preprocessing panicked; falling back to grayscale");
            fallback(gray)
        }
    }
}

fn fallback(gray: GrayImage) -> Preprocessed {
    Preprocessed {
        image: gray,
        skew_degrees: 0.0,
        degraded: true,
    }
}

fn run_chain(gray: &GrayImage, options: &PreprocessOptions) -> Result<(GrayImage, f32), PreprocessError> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage { width, height });
    }

    let mut img = if options.binarize {
        binarize(gray, options.block_radius, options.threshold_offset)
    } else {
        gray.clone()
    };

    if options.denoise {
        img = denoise(&img);
    }

    let mut skew_degrees = 0.0;
    if options.deskew {
        let estimate = estimate_skew(&img, options.deskew_method);
        if let Some(angle) = estimate.and_then(|a| correction(a, options.max_skew_degrees)) {
            img = rotate(&img, angle, options.binarize);
            skew_degrees = angle;
        }
        debug!(?estimate, applied = skew_degrees, "Deskew");
    }

    if options.upscale {
        img = upscale(&img, options.min_long_edge, options.binarize)?;
    }

    Ok((img, skew_degrees))
}

// ── Binarization ─────────────────────────────────────────────────────────────

/// Adaptive mean threshold combined with a global Otsu threshold.
///
/// A pixel stays black only when both thresholds call it foreground. The
/// adaptive pass follows uneven illumination; the global pass suppresses the
/// speckle the adaptive pass produces in flat background regions.
pub fn binarize(gray: &GrayImage, block_radius: u32, offset: i32) -> GrayImage {
    let (width, height) = gray.dimensions();
    let integral = compute_integral_image(gray);
    let global = otsu_threshold(gray);
    debug!(global, block_radius, offset, "Binarizing");

    GrayImage::from_fn(width, height, |x, y| {
        let value = gray.get_pixel(x, y).0[0];
        let local_mean = region_mean(&integral, width, height, x, y, block_radius.max(1));
        let local = (local_mean as i32 - offset).clamp(0, 255) as u8;
        if value < local && value < global {
            Luma([0])
        } else {
            Luma([255])
        }
    })
}

/// Summed-area table of size `(width+1) × (height+1)` with a zero border.
fn compute_integral_image(gray: &GrayImage) -> Vec<u64> {
    let (w, h) = gray.dimensions();
    let stride = (w + 1) as usize;
    let mut table = vec![0u64; stride * (h + 1) as usize];

    for y in 0..h {
        let mut row_sum: u64 = 0;
        for x in 0..w {
            row_sum += gray.get_pixel(x, y).0[0] as u64;
            let idx = (y + 1) as usize * stride + (x + 1) as usize;
            let above = y as usize * stride + (x + 1) as usize;
            table[idx] = row_sum + table[above];
        }
    }

    table
}

/// Mean of the square window of `radius` around (cx, cy), clamped to the image.
fn region_mean(integral: &[u64], img_width: u32, img_height: u32, cx: u32, cy: u32, radius: u32) -> f64 {
    let stride = (img_width + 1) as usize;

    let x1 = cx.saturating_sub(radius) as usize;
    let y1 = cy.saturating_sub(radius) as usize;
    let x2 = ((cx + radius + 1) as usize).min(img_width as usize);
    let y2 = ((cy + radius + 1) as usize).min(img_height as usize);

    let area = ((x2 - x1) * (y2 - y1)) as f64;
    if area == 0.0 {
        return 128.0;
    }

    let sum = integral[y2 * stride + x2] as f64 - integral[y1 * stride + x2] as f64
        - integral[y2 * stride + x1] as f64
        + integral[y1 * stride + x1] as f64;

    sum / area
}

/// Otsu's threshold: maximises the between-class variance of the histogram.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total_pixels = gray.width() as u64 * gray.height() as u64;
    if total_pixels == 0 {
        return 128;
    }

    let sum_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background: u64 = 0;
    let mut max_variance = 0.0;
    let mut best_threshold: u8 = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count;
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total_pixels - weight_background;
        if weight_foreground == 0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum_total - sum_background) / weight_foreground as f64;

        let between_variance = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground).powi(2);

        if between_variance > max_variance {
            max_variance = between_variance;
            // Pixels strictly below the threshold are foreground.
            best_threshold = (t as u8).saturating_add(1);
        }
    }

    best_threshold
}

// ── Denoise ──────────────────────────────────────────────────────────────────

/// Remove isolated dark specks, leaving every stroke untouched.
///
/// Dark pixels are grouped into 8-connected components; components of one
/// or two pixels are painted white. No morphology is applied, so strokes one
/// or two pixels wide survive intact.
pub fn denoise(img: &GrayImage) -> GrayImage {
    let (width, height) = img.dimensions();
    let mask = GrayImage::from_fn(width, height, |x, y| {
        if img.get_pixel(x, y).0[0] < FOREGROUND_LEVEL {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let mut areas: Vec<u32> = Vec::new();
    for label in labels.pixels().map(|p| p.0[0] as usize).filter(|&l| l != 0) {
        if label >= areas.len() {
            areas.resize(label + 1, 0);
        }
        areas[label] += 1;
    }

    let mut out = img.clone();
    let mut removed = 0usize;
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0] as usize;
        if label != 0 && areas[label] <= MAX_SPECK_PIXELS {
            out.put_pixel(x, y, Luma([255]));
            removed += 1;
        }
    }
    debug!(removed, components = areas.len().saturating_sub(1), "Denoised");
    out
}

// ── Deskew ───────────────────────────────────────────────────────────────────

/// Estimate the dominant text-line angle in degrees.
///
/// Positive angles mean lines descend to the right (clockwise skew in image
/// coordinates). Returns `None` when there is too little foreground to tell.
pub fn estimate_skew(img: &GrayImage, method: DeskewMethod) -> Option<f32> {
    match method {
        DeskewMethod::MinAreaRect => skew_from_min_area_rect(img),
        DeskewMethod::HoughLines => skew_from_hough_lines(img),
    }
}

/// The correction to apply for an estimate, if any.
fn correction(angle: f32, max_skew_degrees: f32) -> Option<f32> {
    let magnitude = angle.abs();
    if magnitude < MIN_CORRECTION_DEGREES || magnitude > max_skew_degrees {
        None
    } else {
        Some(angle)
    }
}

/// Counter-rotate by `degrees`, filling uncovered corners with white.
fn rotate(img: &GrayImage, degrees: f32, binary: bool) -> GrayImage {
    let rotated = rotate_about_center(img, (-degrees).to_radians(), Interpolation::Bilinear, Luma([255]));
    if binary {
        threshold(&rotated, FOREGROUND_LEVEL)
    } else {
        rotated
    }
}

fn skew_from_min_area_rect(img: &GrayImage) -> Option<f32> {
    let points = row_extremes(img);
    let hull = convex_hull(points);
    let angle = min_area_rect_angle(&hull)?;
    Some(angle as f32)
}

/// Leftmost and rightmost foreground pixel of every row.
///
/// Every other foreground pixel lies between two of these, so their convex
/// hull equals the hull of the whole foreground.
fn row_extremes(img: &GrayImage) -> Vec<(i64, i64)> {
    let (width, height) = img.dimensions();
    let mut points = Vec::new();
    for y in 0..height {
        let is_fg = |x: &u32| img.get_pixel(*x, y).0[0] < FOREGROUND_LEVEL;
        let first = (0..width).find(is_fg);
        let last = (0..width).rev().find(is_fg);
        if let (Some(first), Some(last)) = (first, last) {
            points.push((first as i64, y as i64));
            if last != first {
                points.push((last as i64, y as i64));
            }
        }
    }
    points
}

/// Andrew's monotone chain. Returns the hull counter-clockwise without
/// collinear points.
fn convex_hull(mut points: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    points.sort_unstable();
    points.dedup();
    if points.len() < 3 {
        return points;
    }

    fn cross(o: (i64, i64), a: (i64, i64), b: (i64, i64)) -> i64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }

    let mut lower: Vec<(i64, i64)> = Vec::new();
    for &p in &points {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<(i64, i64)> = Vec::new();
    for &p in points.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Angle of the minimum-area enclosing rectangle, folded into (-45°, 45°].
///
/// The optimal rectangle has one side collinear with a hull edge, so only
/// hull edge directions need to be tried.
fn min_area_rect_angle(hull: &[(i64, i64)]) -> Option<f64> {
    if hull.len() < 3 {
        return None;
    }

    let mut best: Option<(f64, f64)> = None;
    for i in 0..hull.len() {
        let (x1, y1) = hull[i];
        let (x2, y2) = hull[(i + 1) % hull.len()];
        let (dx, dy) = ((x2 - x1) as f64, (y2 - y1) as f64);
        let len = dx.hypot(dy);
        if len == 0.0 {
            continue;
        }
        let (ux, uy) = (dx / len, dy / len);

        let (mut min_u, mut max_u) = (f64::MAX, f64::MIN);
        let (mut min_v, mut max_v) = (f64::MAX, f64::MIN);
        for &(px, py) in hull {
            let (px, py) = (px as f64, py as f64);
            let u = px * ux + py * uy;
            let v = -px * uy + py * ux;
            min_u = min_u.min(u);
            max_u = max_u.max(u);
            min_v = min_v.min(v);
            max_v = max_v.max(v);
        }

        let area = (max_u - min_u) * (max_v - min_v);
        if best.is_none_or(|(best_area, _)| area < best_area) {
            best = Some((area, dy.atan2(dx).to_degrees()));
        }
    }

    best.map(|(_, angle)| fold_quarter_turn(angle))
}

/// Map any angle onto the equivalent rectangle orientation in (-45°, 45°].
fn fold_quarter_turn(degrees: f64) -> f64 {
    let mut a = degrees % 90.0;
    if a > 45.0 {
        a -= 90.0;
    } else if a <= -45.0 {
        a += 90.0;
    }
    a
}

/// Median angle of near-horizontal Hough lines through dilated text.
fn skew_from_hough_lines(img: &GrayImage) -> Option<f32> {
    let (width, height) = img.dimensions();
    let scale = (HOUGH_MAX_EDGE as f32 / width.max(height) as f32).min(1.0);
    let small = if scale < 1.0 {
        let w = ((width as f32 * scale).round() as u32).max(1);
        let h = ((height as f32 * scale).round() as u32).max(1);
        threshold(&imageops::resize(img, w, h, FilterType::Triangle), FOREGROUND_LEVEL)
    } else {
        threshold(img, FOREGROUND_LEVEL)
    };

    let mut text = small;
    imageops::invert(&mut text);
    let text = dilate(&text, Norm::LInf, 2);

    let options = LineDetectionOptions {
        vote_threshold: (text.width() / 4).max(20),
        suppression_radius: 8,
    };
    let lines = detect_lines(&text, options);

    // r = x·cosθ + y·sinθ: a horizontal line has θ = 90°.
    let mut angles: Vec<f32> = lines
        .iter()
        .map(|l| l.angle_in_degrees as f32 - 90.0)
        .filter(|a| a.abs() < 45.0)
        .collect();
    debug!(lines = lines.len(), near_horizontal = angles.len(), "Hough lines detected");

    if angles.len() < 3 {
        return None;
    }
    angles.sort_by(|a, b| a.total_cmp(b));
    let mid = angles.len() / 2;
    Some(if angles.len() % 2 == 0 {
        (angles[mid - 1] + angles[mid]) / 2.0
    } else {
        angles[mid]
    })
}

// ── Upscale ──────────────────────────────────────────────────────────────────

/// Scale up so the longer edge reaches `min_long_edge`.
fn upscale(img: &GrayImage, min_long_edge: u32, binary: bool) -> Result<GrayImage, PreprocessError> {
    let (width, height) = img.dimensions();
    let long_edge = width.max(height);
    if long_edge >= min_long_edge {
        return Ok(img.clone());
    }

    let factor = min_long_edge as f64 / long_edge as f64;
    let new_w = ((width as f64 * factor).round() as u32).max(1);
    let new_h = ((height as f64 * factor).round() as u32).max(1);
    if new_w as u64 * new_h as u64 > MAX_UPSCALED_PIXELS {
        return Err(PreprocessError::UpscaleTooLarge {
            width: new_w,
            height: new_h,
        });
    }

    debug!(from_w = width, from_h = height, to_w = new_w, to_h = new_h, "Upscaling");
    let resized = imageops::resize(img, new_w, new_h, FilterType::CatmullRom);
    Ok(if binary {
        threshold(&resized, FOREGROUND_LEVEL)
    } else {
        resized
    })
}

fn threshold(img: &GrayImage, level: u8) -> GrayImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] < level { 0 } else { 255 };
    }
    out
}
