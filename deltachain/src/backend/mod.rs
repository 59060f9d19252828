//! Lower-layer engine abstraction.
//!
//! The chain logic never touches delta files, device nodes or the inner
//! filesystem directly. Everything below the descriptor goes through
//! [`ImageBackend`]:
//! - `MemoryBackend` - in-process engine, supports every live operation
//! - `LocalBackend` - qcow2 deltas on `qemu-nbd` devices with ext4 inside

use std::fmt;
use std::path::{Path, PathBuf};

use deltachain_shared::errors::DeltaResult;
use serde::{Deserialize, Serialize};

use crate::descriptor::ImageMode;

pub mod local;
pub mod memory;

pub use local::{LocalBackend, LocalBackendConfig};
pub use memory::MemoryBackend;

/// OS-visible block device node (e.g. "/dev/nbd0").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceNode(String);

impl DeviceNode {
    pub fn new(node: impl Into<String>) -> Self {
        Self(node.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time state of a device node as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Attached,
    Detached,
    /// The engine could not tell (e.g. sysfs unreadable).
    Unknown,
}

/// A device found holding a layer, possibly left behind by another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub device: DeviceNode,
    /// Layer file exposed as the device's top.
    pub layer: PathBuf,
    pub mount_point: Option<PathBuf>,
    pub read_only: bool,
}

/// Inner filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FsStats {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub inodes: u64,
    pub inodes_free: u64,
}

/// Geometry reported by the engine for one image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    pub size_sectors: u64,
    pub block_size_sectors: u32,
    pub format_version: u32,
}

/// Filesystem mount request passed to [`ImageBackend::mount_fs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsMountRequest {
    pub target: PathBuf,
    /// Raw `MS_*` flag bits.
    pub flags: u64,
    /// Auxiliary mount data (comma separated options).
    pub data: String,
    pub read_only: bool,
    /// Run a filesystem check before mounting.
    pub fsck: bool,
    pub quota: bool,
}

/// Engine that owns delta files, device nodes and the inner filesystem.
///
/// Operations taking `live: Option<&DeviceNode>` are called with the bound
/// device when the affected layer is part of the attached chain; engines
/// that cannot change an attached chain report `DeltaError::Busy`.
pub trait ImageBackend: Send + Sync {
    /// Stable name, used as the key for process-wide kernel support state.
    fn name(&self) -> &str;

    /// Load whatever kernel support the engine needs. Must be idempotent.
    fn ensure_kernel_support(&self) -> DeltaResult<()>;

    /// Create a base image with an empty inner filesystem.
    fn create_image(&self, path: &Path, mode: ImageMode, size_sectors: u64) -> DeltaResult<()>;

    /// Create an empty delta whose reads fall through to `parent`.
    fn create_delta(&self, path: &Path, parent: &Path, size_sectors: u64) -> DeltaResult<()>;

    fn image_exists(&self, path: &Path) -> bool;

    fn remove_image(&self, path: &Path) -> DeltaResult<()>;

    /// Atomically move `from` over `to`, replacing `to` if it exists.
    fn rename_image(&self, from: &Path, to: &Path) -> DeltaResult<()>;

    /// Fold `lower` into its only child: blocks present in `lower` and
    /// absent from `child` are copied up, then `child` is re-parented onto
    /// `new_parent` (`None` makes it a standalone base).
    fn fold_into_child(
        &self,
        lower: &Path,
        child: &Path,
        new_parent: Option<&Path>,
        live: Option<&DeviceNode>,
    ) -> DeltaResult<()>;

    fn resize_image(&self, path: &Path, size_sectors: u64, live: Option<&DeviceNode>)
    -> DeltaResult<()>;

    fn read_image_geometry(&self, path: &Path) -> DeltaResult<ImageGeometry>;

    /// Attach `layers[..=top_index]` (base first) to a fresh device node.
    fn attach_layers(
        &self,
        layers: &[PathBuf],
        top_index: usize,
        read_only: bool,
    ) -> DeltaResult<DeviceNode>;

    /// Make `path` the new writable top of an attached chain.
    fn push_top_layer(&self, device: &DeviceNode, path: &Path) -> DeltaResult<()>;

    /// Undo [`push_top_layer`](Self::push_top_layer).
    fn pop_top_layer(&self, device: &DeviceNode) -> DeltaResult<()>;

    /// Point the attached chain's layer at `level` to a different file.
    fn swap_layer(&self, device: &DeviceNode, level: usize, path: &Path) -> DeltaResult<()>;

    fn detach(&self, device: &DeviceNode) -> DeltaResult<()>;

    fn device_status(&self, device: &DeviceNode) -> DeviceStatus;

    /// Find a device whose top layer is `layer`.
    fn find_attached(&self, layer: &Path) -> DeltaResult<Option<Attachment>>;

    fn mount_fs(&self, device: &DeviceNode, request: &FsMountRequest) -> DeltaResult<()>;

    fn unmount_fs(&self, target: &Path) -> DeltaResult<()>;

    fn stat_fs(&self, target: &Path) -> DeltaResult<FsStats>;

    /// Smallest size (in sectors) the inner filesystem can shrink to.
    fn fs_min_sectors(&self, device: &DeviceNode) -> DeltaResult<u64>;

    fn resize_fs(&self, device: &DeviceNode, target: Option<&Path>, size_sectors: u64)
    -> DeltaResult<()>;
}
