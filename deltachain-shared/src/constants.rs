//! Shared constants.
//!
//! Sizes cross the API boundary in kilobytes and are stored in
//! 512-byte sectors; both sides must use the same conversion.

/// Size units
pub mod units {
    /// Sector size in bytes (descriptor geometry is expressed in sectors)
    pub const SECTOR_SIZE: u64 = 512;

    /// Sectors per kilobyte
    pub const SECTORS_PER_KB: u64 = 1024 / SECTOR_SIZE;

    /// Convert a size in kilobytes to sectors.
    ///
    /// `None` when the size in bytes does not fit in a `u64`.
    pub const fn kb_to_sectors(kb: u64) -> Option<u64> {
        match kb.checked_mul(1024) {
            Some(_) => Some(kb * SECTORS_PER_KB),
            None => None,
        }
    }

    /// Convert a size in sectors to kilobytes (rounded down).
    pub const fn sectors_to_kb(sectors: u64) -> u64 {
        sectors / SECTORS_PER_KB
    }
}

/// Image directory file names
pub mod filenames {
    /// Descriptor file stored in the image directory
    pub const DESCRIPTOR: &str = "DiskDescriptor.json";

    /// Base image name used when the caller does not pick one
    pub const DEFAULT_BASE_IMAGE: &str = "root.hdd";
}

/// Environment variables
pub mod envs {
    /// Default descriptor path for the CLI
    pub const DESCRIPTOR: &str = "DELTACHAIN_DESCRIPTOR";

    /// Override for the qemu-img binary
    pub const QEMU_IMG: &str = "DELTACHAIN_QEMU_IMG";

    /// Override for the qemu-nbd binary
    pub const QEMU_NBD: &str = "DELTACHAIN_QEMU_NBD";

    /// Override for the inner filesystem type
    pub const FS_TYPE: &str = "DELTACHAIN_FS_TYPE";
}

#[cfg(test)]
mod tests {
    use super::units::*;

    #[test]
    fn test_kb_sector_conversion() {
        assert_eq!(kb_to_sectors(1), Some(2));
        assert_eq!(kb_to_sectors(393216), Some(786432));
        assert_eq!(kb_to_sectors(u64::MAX / 1024), Some(u64::MAX / 1024 * 2));
        assert_eq!(kb_to_sectors(u64::MAX / 1024 + 1), None);
        assert_eq!(kb_to_sectors(u64::MAX), None);
        assert_eq!(sectors_to_kb(786432), 393216);
        assert_eq!(sectors_to_kb(3), 1);
    }
}
