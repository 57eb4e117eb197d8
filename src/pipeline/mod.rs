//! Pipeline stages for document OCR.
//!
//! Each submodule implements one step. Stages are plain functions or small
//! traits over owned buffers, so each can be tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ source ──▶ preprocess ──▶ recognize ──▶ aggregate
//! (detect)  (pdfium /   (binarize,     (engine      (sorted
//!            raster)     deskew, …)     pool)        Document)
//!                 │
//!                 └──▶ encode ──▶ archive        (conversion-only)
//! ```
//!
//! 1. [`input`]: decide PDF vs raster from magic bytes and extension
//! 2. [`source`] / [`render`]: page count, text layer and page images;
//!    pdfium calls are serialised behind a lock
//! 3. [`preprocess`]: deterministic normalisation ahead of recognition
//! 4. [`recognize`]: engine trait, the Tesseract adapter and the tier pool
//! 5. [`coordinator`]: bounded fan-out over pages with progress and
//!    cancellation
//! 6. [`aggregate`]: sort and verify pages into a `Document`
//! 7. [`encode`] / [`archive`]: page images and zip packaging
//!
//! [`scratch`] and [`text`] are shared helpers.

pub mod aggregate;
pub mod archive;
pub mod coordinator;
pub mod encode;
pub mod input;
pub mod preprocess;
pub mod recognize;
pub mod render;
pub mod scratch;
pub mod source;
pub mod text;
