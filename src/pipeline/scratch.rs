//! Scoped scratch space on the local filesystem.
//!
//! Stages that must hand files to an external process (the recognition
//! engine reads its input from disk and writes its output there) create a
//! [`ScratchDir`]. The directory name is unique per call and the whole tree
//! is deleted when the value is dropped, on success, error, panic unwind or
//! cancellation alike.

use crate::error::OcrError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of every scratch directory the pipeline creates.
pub const SCRATCH_PREFIX: &str = "edgequake-ocr-";

/// A uniquely named directory removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create a fresh directory under `root`, creating `root` if needed.
    pub fn create(root: &Path) -> Result<Self, OcrError> {
        std::fs::create_dir_all(root).map_err(|source| OcrError::ScratchIo {
            path: root.to_path_buf(),
            source,
        })?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)
            .map_err(|source| OcrError::ScratchIo {
                path: root.to_path_buf(),
                source,
            })?;
        debug!(path = %dir.path().display(), "Scratch directory created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A path inside the directory that does not exist yet.
    ///
    /// `extension` is given without the leading dot; pass `""` for none.
    pub fn new_temp_file_name(&self, extension: &str) -> PathBuf {
        let stem = Uuid::new_v4().simple().to_string().to_uppercase();
        if extension.is_empty() {
            self.path().join(stem)
        } else {
            self.path().join(format!("{stem}.{extension}"))
        }
    }

    /// Write `bytes` to a new uniquely named file and return its path.
    pub fn create_file(&self, extension: &str, bytes: &[u8]) -> Result<PathBuf, OcrError> {
        let path = self.new_temp_file_name(extension);
        std::fs::write(&path, bytes).map_err(|source| OcrError::ScratchIo {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Delete the directory now and report failures, instead of the silent
    /// best-effort removal done on drop.
    pub fn close(self) -> Result<(), OcrError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|source| {
            warn!(path = %path.display(), error = %source, "Failed to remove scratch directory");
            OcrError::ScratchIo { path, source }
        })
    }
}

/// Scratch directories currently present under `root`.
///
/// Used by diagnostics and tests to confirm nothing leaked.
pub fn leftover_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX))
        .map(|e| e.path())
        .collect()
}
