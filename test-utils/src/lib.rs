//! Shared fixtures for deltachain integration tests.
//!
//! Disks live in a temporary directory and run on the in-memory engine, so
//! every chain operation (live ones included) works without root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use deltachain::backend::MemoryBackend;
use deltachain::{CreateParams, DeltaResult, Descriptor};
use tempfile::TempDir;

/// Default disk size used by fixtures (384 MiB).
pub const TEST_DISK_KB: u64 = 393216;

/// A disk in a temporary directory, removed on drop.
pub struct TestDisk {
    pub backend: Arc<MemoryBackend>,
    pub descriptor: Descriptor,
    dir: TempDir,
}

impl TestDisk {
    /// Fresh disk of `size_kb` with the default base image name.
    pub fn new(size_kb: u64) -> Self {
        Self::with_params(CreateParams::new(size_kb))
    }

    pub fn with_params(params: CreateParams) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let backend = Arc::new(MemoryBackend::new());
        let descriptor = Descriptor::create(dir.path(), &params, backend.clone())
            .expect("Failed to create disk");
        Self {
            backend,
            descriptor,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.descriptor.path().to_path_buf()
    }

    /// Close the descriptor and open it again from disk.
    pub fn reopen(self) -> DeltaResult<Self> {
        let Self {
            backend,
            descriptor,
            dir,
        } = self;
        let path = descriptor.path().to_path_buf();
        descriptor.close();
        let descriptor = Descriptor::open(&path, backend.clone())?;
        Ok(Self {
            backend,
            descriptor,
            dir,
        })
    }

    /// Checksum of what the active chain exposes.
    pub fn chain_checksum(&self) -> String {
        let chain = self
            .descriptor
            .active_chain_paths()
            .expect("Failed to resolve active chain");
        self.backend
            .content_checksum(&chain)
            .expect("Failed to checksum chain")
    }

    /// Write `value` at `block` of the top layer.
    pub fn write_top(&self, block: u64, value: u64) {
        let top = self
            .descriptor
            .top_layer()
            .map(|layer| self.descriptor.resolve(layer.path()))
            .expect("Failed to resolve top layer");
        self.backend
            .write_image_block(&top, block, value)
            .expect("Failed to write block");
    }
}
