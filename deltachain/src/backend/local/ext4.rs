//! Inner ext4 filesystem tooling (e2fsprogs).

use std::path::Path;
use std::process::Command;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use super::run;
use crate::constants::fs::DEFAULT_FS_BLOCK_SIZE;
use crate::constants::units::SECTOR_SIZE;

/// Create an empty filesystem on `target` (a file or a block device).
pub fn make_fs(fs_type: &str, target: &Path) -> DeltaResult<()> {
    tracing::info!(target = %target.display(), fs_type, "Creating filesystem");

    // -m 0: no reserved blocks
    // -F: do not ask about regular files or whole devices
    run::run(
        Command::new("mke2fs")
            .args(["-q", "-F", "-m", "0", "-t", fs_type, "-b"])
            .arg(DEFAULT_FS_BLOCK_SIZE.to_string())
            .arg(target),
        &format!("create {} filesystem on {}", fs_type, target.display()),
    )?;
    Ok(())
}

/// Check and repair `device`.
///
/// Exit codes 1 (errors corrected) and 2 (reboot advised) are not
/// failures for an unmounted device.
pub fn check_fs(device: &Path, force: bool) -> DeltaResult<()> {
    let mut cmd = Command::new("e2fsck");
    cmd.arg("-p");
    if force {
        cmd.arg("-f");
    }
    cmd.arg(device);
    run::run_allowing(
        &mut cmd,
        &format!("check filesystem on {}", device.display()),
        &[0, 1, 2],
    )?;
    Ok(())
}

/// Smallest size the filesystem on `device` can be shrunk to, in sectors.
pub fn min_size_sectors(device: &Path) -> DeltaResult<u64> {
    let output = run::run(
        Command::new("resize2fs").arg("-P").arg(device),
        &format!("estimate minimum size of {}", device.display()),
    )?;
    let blocks = parse_min_size(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        DeltaError::Storage(format!(
            "Unexpected resize2fs -P output for {}",
            device.display()
        ))
    })?;
    Ok(blocks * (DEFAULT_FS_BLOCK_SIZE / SECTOR_SIZE))
}

/// Grow or shrink the filesystem on `device` to `size_sectors`.
pub fn resize_fs(device: &Path, size_sectors: u64) -> DeltaResult<()> {
    tracing::info!(device = %device.display(), size_sectors, "Resizing filesystem");
    run::run(
        Command::new("resize2fs")
            .arg(device)
            .arg(format!("{}s", size_sectors)),
        &format!("resize filesystem on {}", device.display()),
    )?;
    Ok(())
}

/// "Estimated minimum size of the filesystem: 12345"
fn parse_min_size(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.split_once("minimum size of the filesystem:"))
        .and_then(|(_, n)| n.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_min_size() {
        let out = "resize2fs 1.47.0 (5-Feb-2023)\nEstimated minimum size of the filesystem: 4417\n";
        assert_eq!(parse_min_size(out), Some(4417));
    }

    #[test]
    fn test_parse_min_size_garbage() {
        assert_eq!(parse_min_size("resize2fs: Bad magic number"), None);
        assert_eq!(parse_min_size(""), None);
    }
}
