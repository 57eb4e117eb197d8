//! Page sources: one logical page in, one raw image (or text layer) out.
//!
//! A [`PageSource`] hides whether pages come from a PDF (rendered through
//! pdfium, see [`super::render`]) or from a raster image that is itself the
//! single page. All methods are blocking and are called from worker threads.

use crate::config::RenderOptions;
use crate::error::OcrError;
use crate::pipeline::input::{InputKind, RasterFormat};
use crate::pipeline::render::PdfSource;
use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

/// A document whose pages can be inspected and rendered independently.
///
/// Page numbers are 1-based. Implementations must be safe to call from many
/// worker threads at once.
pub trait PageSource: Send + Sync {
    /// Number of logical pages.
    fn page_count(&self) -> usize;

    /// Embedded machine-readable text of `page`, if the format has one.
    fn text_layer(&self, page: usize) -> Result<Option<String>, OcrError>;

    /// Raw image of `page`.
    fn render(&self, page: usize) -> Result<DynamicImage, OcrError>;
}

/// A raster image treated as a one-page document.
pub struct RasterSource {
    filename: String,
    image: DynamicImage,
}

impl RasterSource {
    /// Decode `bytes`. Decoding failures mean the content does not match its
    /// declared type.
    pub fn decode(bytes: &[u8], filename: &str, format: RasterFormat) -> Result<Self, OcrError> {
        let image = image::load_from_memory_with_format(bytes, format.image_format()).map_err(|e| {
            OcrError::UnsupportedFormat {
                filename: filename.to_string(),
                detail: format!("cannot decode {format:?}: {e}"),
            }
        })?;
        debug!(
            filename,
            width = image.width(),
            height = image.height(),
            "Raster input decoded"
        );
        Ok(Self::from_image(filename, image))
    }

    pub fn from_image(filename: &str, image: DynamicImage) -> Self {
        Self {
            filename: filename.to_string(),
            image,
        }
    }
}

impl PageSource for RasterSource {
    fn page_count(&self) -> usize {
        1
    }

    fn text_layer(&self, _page: usize) -> Result<Option<String>, OcrError> {
        Ok(None)
    }

    fn render(&self, page: usize) -> Result<DynamicImage, OcrError> {
        if page != 1 {
            return Err(OcrError::PageOutOfRange { page, total: 1 });
        }
        debug!(filename = %self.filename, "Raster page served without rendering");
        Ok(self.image.clone())
    }
}

/// Open `bytes` as a page source of the given kind.
///
/// Blocking: for PDFs this binds pdfium and reads the page count.
pub fn open_source(
    bytes: Vec<u8>,
    filename: &str,
    kind: InputKind,
    options: &RenderOptions,
) -> Result<Arc<dyn PageSource>, OcrError> {
    match kind {
        InputKind::Pdf => Ok(Arc::new(PdfSource::open(bytes, filename, options.clone())?)),
        InputKind::Image(format) => Ok(Arc::new(RasterSource::decode(&bytes, filename, format)?)),
    }
}
