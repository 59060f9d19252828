//! deltachain - copy-on-write delta chains for snapshot-capable disks
//!
//! A disk is a base image plus a tree of deltas recorded in a
//! `DiskDescriptor.json`. The active chain (base up to the writable top)
//! can be attached to a block device and mounted, snapshotted, switched,
//! merged, partially replaced and resized.
//!
//! All state changes go through [`Descriptor`]; the storage below it is
//! an [`ImageBackend`](backend::ImageBackend).

pub mod backend;
pub mod chain;
pub mod constants;
pub mod descriptor;
pub mod device;
pub mod inspect;
pub mod logging;
mod resize;
pub mod snapshot_id;

pub use backend::{ImageBackend, LocalBackend, LocalBackendConfig, MemoryBackend};
pub use chain::{LayerSelector, ReplaceParams, SwitchPolicy};
pub use descriptor::{
    ChainState, CreateParams, Descriptor, Geometry, ImageMode, Layer, LayerId, LayerState,
};
pub use device::{BoundDevice, MountOptions};
pub use inspect::{FsInfo, ImageInfo, fs_info};
pub use logging::{VerboseLevel, close_log_file, set_log_file, set_log_level, set_verbose_level};
pub use snapshot_id::{SnapshotId, generate_uuid};

pub use deltachain_shared::{DeltaError, DeltaResult};
