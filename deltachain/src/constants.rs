//! Library constants.

pub use deltachain_shared::constants::{envs, filenames, units};

/// Descriptor store
pub mod descriptor {
    /// Current `DiskDescriptor.json` schema version
    pub const SCHEMA_VERSION: u32 = 1;

    /// Suffix appended to the descriptor file name to form the lock file
    pub const LOCK_SUFFIX: &str = ".lock";
}

/// Image geometry defaults
pub mod geometry {
    /// Allocation block size in sectors (1 MiB)
    pub const DEFAULT_BLOCK_SIZE_SECTORS: u32 = 2048;

    /// Format version reported for qcow2 images
    pub const QCOW2_FORMAT_VERSION: u32 = 3;

    /// Format version reported for raw images
    pub const RAW_FORMAT_VERSION: u32 = 0;

    /// Format version reported by the in-memory engine
    pub const MEMORY_FORMAT_VERSION: u32 = 2;
}

/// Inner filesystem defaults
pub mod fs {
    /// Filesystem created inside new base images
    pub const DEFAULT_FS_TYPE: &str = "ext4";

    /// Filesystem block size in bytes
    pub const DEFAULT_FS_BLOCK_SIZE: u64 = 4096;
}
