//! PDF pages via pdfium: page count, text layer and rasterisation.
//!
//! pdfium keeps global library state and is not designed for concurrent use,
//! so every call into it happens under [`PDFIUM_LOCK`]. Page workers still
//! overlap: only the render step is serialised, while preprocessing and
//! recognition of other pages carry on in parallel.
//!
//! Pages are rendered to a fixed target width (capped in height) rather than
//! a fixed DPI, which keeps memory bounded and recognition quality consistent
//! no matter how large the physical page is.

use crate::config::RenderOptions;
use crate::error::OcrError;
use crate::pipeline::source::PageSource;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

static PDFIUM_LOCK: Mutex<()> = Mutex::new(());

/// A PDF held in memory, opened on demand for each page operation.
pub struct PdfSource {
    bytes: Vec<u8>,
    filename: String,
    page_count: usize,
    options: RenderOptions,
}

impl PdfSource {
    /// Parse `bytes` and read the page count.
    ///
    /// Any failure here is an [`OcrError::ExtractionFailure`]: without a page
    /// count there is nothing to fan out over.
    pub fn open(bytes: Vec<u8>, filename: &str, options: RenderOptions) -> Result<Self, OcrError> {
        let page_count = with_document(&bytes, filename, &options, |doc| {
            Ok(doc.pages().len() as usize)
        })?;
        info!(filename, page_count, "PDF loaded");
        Ok(Self {
            bytes,
            filename: filename.to_string(),
            page_count,
            options,
        })
    }

    fn check_page(&self, page: usize) -> Result<(), OcrError> {
        if page == 0 || page > self.page_count {
            return Err(OcrError::PageOutOfRange {
                page,
                total: self.page_count,
            });
        }
        Ok(())
    }
}

impl PageSource for PdfSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn text_layer(&self, page: usize) -> Result<Option<String>, OcrError> {
        self.check_page(page)?;
        with_document(&self.bytes, &self.filename, &self.options, |doc| {
            let pdf_page = doc
                .pages()
                .get((page - 1) as u16)
                .map_err(|e| page_failure(&self.filename, page, e))?;
            let text = pdf_page
                .text()
                .map_err(|e| page_failure(&self.filename, page, e))?
                .all();
            debug!(page, chars = text.len(), "Text layer read");
            Ok(if text.trim().is_empty() { None } else { Some(text) })
        })
    }

    fn render(&self, page: usize) -> Result<DynamicImage, OcrError> {
        self.check_page(page)?;
        let render_config = PdfRenderConfig::new()
            .set_target_width(self.options.target_width as i32)
            .set_maximum_height(self.options.max_rendered_pixels as i32);

        with_document(&self.bytes, &self.filename, &self.options, |doc| {
            let pdf_page = doc
                .pages()
                .get((page - 1) as u16)
                .map_err(|e| page_failure(&self.filename, page, e))?;
            let bitmap = pdf_page
                .render_with_config(&render_config)
                .map_err(|e| page_failure(&self.filename, page, e))?;
            let image = bitmap.as_image();
            debug!(
                page,
                width = image.width(),
                height = image.height(),
                "Rendered page"
            );
            Ok(image)
        })
    }
}

/// Bind pdfium, load the document and run `f` while holding the lock.
fn with_document<T>(
    bytes: &[u8],
    filename: &str,
    options: &RenderOptions,
    f: impl FnOnce(&PdfDocument<'_>) -> Result<T, OcrError>,
) -> Result<T, OcrError> {
    let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let pdfium = bind_pdfium(options.pdfium_library.as_deref())?;

    let document = pdfium.load_pdf_from_byte_slice(bytes, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        let detail = if err_str.contains("Password") || err_str.contains("password") {
            "document is password protected".to_string()
        } else {
            err_str
        };
        OcrError::ExtractionFailure {
            filename: filename.to_string(),
            detail,
        }
    })?;

    f(&document)
}

fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, OcrError> {
    let bindings = match library {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    };
    bindings
        .map(Pdfium::new)
        .map_err(|e| OcrError::PdfiumBindingFailed(e.to_string()))
}

fn page_failure(filename: &str, page: usize, e: PdfiumError) -> OcrError {
    OcrError::ExtractionFailure {
        filename: filename.to_string(),
        detail: format!("page {page}: {e:?}"),
    }
}
