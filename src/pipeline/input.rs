//! Input validation: decide what kind of document a byte buffer holds.
//!
//! Detection runs before anything else in a request, so bad input is
//! rejected before a scratch directory is created or a worker is spawned.
//!
//! The filename extension is the *declared* type; the magic bytes are the
//! *actual* type. Both must agree. A file without an extension is accepted
//! on content alone.

use crate::error::OcrError;
use std::path::Path;
use tracing::debug;

/// Raster formats accepted as single-page inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
}

impl RasterFormat {
    pub fn image_format(self) -> image::ImageFormat {
        match self {
            RasterFormat::Png => image::ImageFormat::Png,
            RasterFormat::Jpeg => image::ImageFormat::Jpeg,
            RasterFormat::Tiff => image::ImageFormat::Tiff,
            RasterFormat::Bmp => image::ImageFormat::Bmp,
        }
    }
}

/// What a request's bytes contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Image(RasterFormat),
}

impl InputKind {
    /// Identify `bytes`, cross-checking against the extension of `filename`.
    pub fn detect(bytes: &[u8], filename: &str) -> Result<Self, OcrError> {
        let declared = declared_kind(filename)?;
        let actual = sniff(bytes).ok_or_else(|| OcrError::UnsupportedFormat {
            filename: filename.to_string(),
            detail: format!("unrecognised content, first bytes: {:?}", magic(bytes)),
        })?;

        if let Some(declared) = declared {
            if declared != actual {
                return Err(OcrError::UnsupportedFormat {
                    filename: filename.to_string(),
                    detail: format!("declared {declared:?} but content is {actual:?}"),
                });
            }
        }

        debug!(filename, kind = ?actual, "Input kind detected");
        Ok(actual)
    }

    pub fn is_pdf(self) -> bool {
        matches!(self, InputKind::Pdf)
    }
}

/// Reject anything that is not a PDF.
pub fn require_pdf(bytes: &[u8], filename: &str) -> Result<(), OcrError> {
    match InputKind::detect(bytes, filename)? {
        InputKind::Pdf => Ok(()),
        other => Err(OcrError::UnsupportedFormat {
            filename: filename.to_string(),
            detail: format!("expected a PDF, got {other:?}"),
        }),
    }
}

/// Reject anything that is not a raster image.
pub fn require_image(bytes: &[u8], filename: &str) -> Result<RasterFormat, OcrError> {
    match InputKind::detect(bytes, filename)? {
        InputKind::Image(format) => Ok(format),
        InputKind::Pdf => Err(OcrError::UnsupportedFormat {
            filename: filename.to_string(),
            detail: "expected an image, got a PDF".to_string(),
        }),
    }
}

/// Filename without directories and extension, for naming derived artifacts.
pub fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}

fn declared_kind(filename: &str) -> Result<Option<InputKind>, OcrError> {
    let Some(ext) = Path::new(filename).extension() else {
        return Ok(None);
    };
    let kind = match ext.to_string_lossy().to_lowercase().as_str() {
        "pdf" => InputKind::Pdf,
        "png" => InputKind::Image(RasterFormat::Png),
        "jpg" | "jpeg" | "jpe" | "jfif" => InputKind::Image(RasterFormat::Jpeg),
        "tif" | "tiff" => InputKind::Image(RasterFormat::Tiff),
        "bmp" => InputKind::Image(RasterFormat::Bmp),
        other => {
            return Err(OcrError::UnsupportedFormat {
                filename: filename.to_string(),
                detail: format!("unsupported extension '.{other}'"),
            })
        }
    };
    Ok(Some(kind))
}

fn sniff(bytes: &[u8]) -> Option<InputKind> {
    if bytes.starts_with(b"%PDF") {
        return Some(InputKind::Pdf);
    }
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Png => Some(InputKind::Image(RasterFormat::Png)),
        image::ImageFormat::Jpeg => Some(InputKind::Image(RasterFormat::Jpeg)),
        image::ImageFormat::Tiff => Some(InputKind::Image(RasterFormat::Tiff)),
        image::ImageFormat::Bmp => Some(InputKind::Image(RasterFormat::Bmp)),
        _ => None,
    }
}

fn magic(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(4)]
}
