//! Image files on disk.

use std::io::Read;
use std::path::{Path, PathBuf};

use deltachain_shared::errors::{DeltaError, DeltaResult};

use super::qcow2::QCOW2_MAGIC;

/// On-disk format of a layer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl ImageFormat {
    /// Name as understood by qemu tools and the qcow2 backing format
    /// extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }

    /// Sniff the format from the file's first bytes.
    pub fn detect(path: &Path) -> DeltaResult<Self> {
        let mut file = std::fs::File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeltaError::NotFound(format!("image {} does not exist", path.display()))
            } else {
                DeltaError::io(format!("failed to open {}", path.display()), e)
            }
        })?;

        let mut magic = [0u8; 4];
        match file.read_exact(&mut magic) {
            Ok(()) if u32::from_be_bytes(magic) == QCOW2_MAGIC => Ok(ImageFormat::Qcow2),
            Ok(()) => Ok(ImageFormat::Raw),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(ImageFormat::Raw),
            Err(e) => Err(DeltaError::io(
                format!("failed to read {}", path.display()),
                e,
            )),
        }
    }
}

/// Image file removed on drop unless [`leak`](Self::leak)ed.
///
/// Holds a half-built image while its filesystem is laid down, so a
/// failed create leaves nothing behind.
pub struct Disk {
    path: PathBuf,
    format: ImageFormat,
}

impl Disk {
    pub fn new(path: PathBuf, format: ImageFormat) -> Self {
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Keep the file.
    pub fn leak(self) -> PathBuf {
        let path = self.path.clone();
        std::mem::forget(self);
        path
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to cleanup disk {}: {}", self.path.display(), e);
            } else {
                tracing::debug!("Cleaned up disk: {}", self.path.display());
            }
        }
    }
}
