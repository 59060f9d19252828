//! Exclusive lock on a descriptor store.
//!
//! An `flock` on `<descriptor>.lock` next to the descriptor file. flock
//! locks belong to the open file description, so a second open of the same
//! store fails whether it comes from another process or another thread of
//! this one.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::constants::descriptor::LOCK_SUFFIX;

/// Held for the lifetime of an open `Descriptor`.
///
/// Released when dropped, or by the kernel when the process exits.
#[derive(Debug)]
pub struct DescriptorLock {
    file: File,
    path: PathBuf,
}

impl DescriptorLock {
    /// Lock file path for a descriptor.
    pub fn lock_path(descriptor: &Path) -> PathBuf {
        let mut name = descriptor
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(LOCK_SUFFIX);

        let mut path = descriptor.to_path_buf();
        path.set_file_name(format!(".{}", name.to_string_lossy()));
        path
    }

    /// Take the lock without blocking.
    ///
    /// Returns `Busy` when another `Descriptor` holds the store.
    pub fn acquire(descriptor: &Path) -> DeltaResult<Self> {
        let lock_path = Self::lock_path(descriptor);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                DeltaError::io(
                    format!("failed to open lock file {}", lock_path.display()),
                    e,
                )
            })?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(DeltaError::Busy(format!(
                    "descriptor {} is already open elsewhere",
                    descriptor.display()
                )));
            }
            return Err(DeltaError::io(
                format!("failed to lock {}", lock_path.display()),
                err,
            ));
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired descriptor lock");

        Ok(Self {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file, then release the lock.
    ///
    /// Only for stores that were never created.
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                lock_path = %self.path.display(),
                error = %e,
                "Failed to remove lock file"
            );
        }
    }
}

impl Drop for DescriptorLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock_path = %self.path.display(), "Released descriptor lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn descriptor_in(dir: &TempDir) -> PathBuf {
        dir.path().join("DiskDescriptor.json")
    }

    #[test]
    fn test_lock_file_location() {
        let dir = TempDir::new().unwrap();
        let lock = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();

        assert_eq!(lock.path(), dir.path().join(".DiskDescriptor.json.lock"));
        assert!(lock.path().exists());
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let _held = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();

        let err = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap_err();
        assert!(matches!(err, DeltaError::Busy(_)));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();
        }
        let _again = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();
    }

    #[test]
    fn test_lock_across_threads() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(descriptor_in(&dir));
        let _held = DescriptorLock::acquire(&path).unwrap();

        let path_clone = Arc::clone(&path);
        let result = thread::spawn(move || DescriptorLock::acquire(&path_clone))
            .join()
            .unwrap();
        assert!(matches!(result, Err(DeltaError::Busy(_))));
    }

    #[test]
    fn test_discard_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let lock = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();
        let path = lock.path().to_path_buf();

        lock.discard();

        assert!(!path.exists());
        let _again = DescriptorLock::acquire(&descriptor_in(&dir)).unwrap();
    }

    #[test]
    fn test_different_stores_independent() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let _a = DescriptorLock::acquire(&descriptor_in(&dir1)).unwrap();
        let _b = DescriptorLock::acquire(&descriptor_in(&dir2)).unwrap();
    }
}
