//! Inspector: read-only queries over filesystem statistics and image
//! geometry.

use std::path::Path;

use deltachain_shared::errors::{DeltaError, DeltaResult};
use serde::Serialize;

use crate::backend::{FsStats, ImageBackend};
use crate::descriptor::{ChainState, Descriptor};

/// Statistics of a mounted inner filesystem.
pub type FsInfo = FsStats;

/// Image geometry as recorded in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Logical size in 512-byte sectors.
    pub blocks: u64,
    /// Allocation block size in sectors.
    pub block_size: u32,
    pub version: u32,
}

/// Filesystem statistics for the disk described by `descriptor`.
///
/// Reads the descriptor without taking the store lock, so it works while
/// another process holds the disk open.
pub fn fs_info(descriptor: &Path, backend: &dyn ImageBackend) -> DeltaResult<FsInfo> {
    let state = ChainState::load(descriptor)?;
    let dir = descriptor.parent().unwrap_or(Path::new("."));

    for layer in state.layers().iter().rev() {
        let path = if layer.path().is_absolute() {
            layer.path().to_path_buf()
        } else {
            dir.join(layer.path())
        };
        if let Some(attachment) = backend.find_attached(&path)?
            && let Some(mount_point) = attachment.mount_point
        {
            return backend.stat_fs(&mount_point);
        }
    }

    Err(DeltaError::NotMounted(format!(
        "no filesystem of {} is mounted",
        descriptor.display()
    )))
}

impl Descriptor {
    /// Filesystem statistics of the bound, mounted device.
    pub fn fs_info(&self) -> DeltaResult<FsInfo> {
        match self.bound.as_ref().and_then(|b| b.mount_point.as_ref()) {
            Some(mount_point) => self.backend.stat_fs(mount_point),
            None => Err(DeltaError::NotMounted(format!(
                "no filesystem of {} is mounted",
                self.path().display()
            ))),
        }
    }

    pub fn image_info(&self) -> ImageInfo {
        let geometry = self.geometry();
        ImageInfo {
            blocks: geometry.size_sectors,
            block_size: geometry.block_size_sectors,
            version: geometry.format_version,
        }
    }
}
