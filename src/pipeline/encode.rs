//! Page image encoding for conversion-only requests.
//!
//! PNG is lossless and the default. TIFF is offered for archival workflows
//! that expect it. Both are encoded in memory; nothing touches disk.

use crate::config::PageImageFormat;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page in `format`.
pub fn encode_page(img: &DynamicImage, format: PageImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format.image_format())?;
    debug!(format = format.extension(), bytes = buf.len(), "Encoded page image");
    Ok(buf)
}
