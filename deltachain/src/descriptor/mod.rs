//! Descriptor store.
//!
//! A [`Descriptor`] is the in-memory owner of one logical disk: the
//! persisted [`ChainState`], the exclusive store lock, the optional bound
//! device and a handle to the image backend. Every mutating operation
//! stages its changes on a clone of the state and only swaps the clone in
//! after [`ChainState::save`] succeeded.

mod lock;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::backend::ImageBackend;
use crate::constants::filenames::{DEFAULT_BASE_IMAGE, DESCRIPTOR};
use crate::constants::units::kb_to_sectors;
use crate::device::BoundDevice;
use crate::snapshot_id::SnapshotId;

pub use lock::DescriptorLock;
pub use state::{ChainState, Geometry, ImageMode, Layer, LayerId, LayerState};

/// Parameters for [`Descriptor::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    /// Logical size in kilobytes.
    pub size_kb: u64,
    pub mode: ImageMode,
    /// Base image file name, relative to the image directory.
    /// `None` uses `root.hdd`.
    pub file: Option<PathBuf>,
}

impl CreateParams {
    pub fn new(size_kb: u64) -> Self {
        Self {
            size_kb,
            mode: ImageMode::default(),
            file: None,
        }
    }

    pub fn mode(mut self, mode: ImageMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Open handle on one logical disk.
pub struct Descriptor {
    path: PathBuf,
    dir: PathBuf,
    pub(crate) state: ChainState,
    pub(crate) bound: Option<BoundDevice>,
    pub(crate) backend: Arc<dyn ImageBackend>,
    poisoned: Option<String>,
    _lock: DescriptorLock,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("path", &self.path)
            .field("backend", &self.backend.name())
            .field("layers", &self.state.layers.len())
            .field("bound", &self.bound)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Descriptor {
    /// Create a new image directory with a single base layer.
    ///
    /// The base image gets an empty inner filesystem. Fails with
    /// `AlreadyExists` if either the descriptor or the base image is
    /// already present.
    pub fn create(
        dir: impl AsRef<Path>,
        params: &CreateParams,
        backend: Arc<dyn ImageBackend>,
    ) -> DeltaResult<Self> {
        let dir = dir.as_ref();
        if params.size_kb == 0 {
            return Err(DeltaError::InvalidArgument(
                "image size must be greater than zero".to_string(),
            ));
        }
        let size_sectors = kb_to_sectors(params.size_kb).ok_or_else(|| {
            DeltaError::InvalidArgument(format!("image size {} KB is too large", params.size_kb))
        })?;

        std::fs::create_dir_all(dir).map_err(|e| {
            DeltaError::io(
                format!("failed to create image directory {}", dir.display()),
                e,
            )
        })?;

        let path = dir.join(DESCRIPTOR);
        let fresh_lock = !DescriptorLock::lock_path(&path).exists();
        let lock = DescriptorLock::acquire(&path)?;

        match Self::create_locked(dir, &path, params, size_sectors, backend.as_ref()) {
            Ok(state) => Ok(Self {
                dir: dir.to_path_buf(),
                path,
                state,
                bound: None,
                backend,
                poisoned: None,
                _lock: lock,
            }),
            Err(e) => {
                if fresh_lock {
                    lock.discard();
                }
                Err(e)
            }
        }
    }

    /// Body of [`create`](Self::create), run with the store locked.
    fn create_locked(
        dir: &Path,
        path: &Path,
        params: &CreateParams,
        size_sectors: u64,
        backend: &dyn ImageBackend,
    ) -> DeltaResult<ChainState> {
        if path.exists() {
            return Err(DeltaError::AlreadyExists(format!(
                "descriptor {} already exists",
                path.display()
            )));
        }

        let file = match &params.file {
            Some(file) if !file.as_os_str().is_empty() => file.clone(),
            _ => PathBuf::from(DEFAULT_BASE_IMAGE),
        };
        let base = resolve_in(dir, &file);
        if backend.image_exists(&base) {
            return Err(DeltaError::AlreadyExists(format!(
                "base image {} already exists",
                base.display()
            )));
        }

        tracing::info!(
            descriptor = %path.display(),
            base = %base.display(),
            size_kb = params.size_kb,
            mode = %params.mode,
            "Creating disk image"
        );
        backend.create_image(&base, params.mode, size_sectors)?;

        let state = match backend.read_image_geometry(&base) {
            Ok(reported) => ChainState::new(
                file,
                Geometry {
                    size_sectors,
                    block_size_sectors: reported.block_size_sectors,
                    format_version: reported.format_version,
                    mode: params.mode,
                },
            ),
            Err(e) => {
                discard_image(backend, &base);
                return Err(e);
            }
        };

        if let Err(e) = state.save(path) {
            discard_image(backend, &base);
            return Err(e);
        }
        Ok(state)
    }

    /// Open an existing descriptor file.
    ///
    /// A device left attached to one of the layers by an earlier process
    /// is picked up as the bound device.
    pub fn open(path: impl AsRef<Path>, backend: Arc<dyn ImageBackend>) -> DeltaResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DeltaError::NotFound(format!(
                "descriptor {} does not exist",
                path.display()
            )));
        }

        let lock = DescriptorLock::acquire(path)?;
        let state = ChainState::load(path)?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut descriptor = Self {
            path: path.to_path_buf(),
            dir,
            state,
            bound: None,
            backend,
            poisoned: None,
            _lock: lock,
        };
        descriptor.bound = descriptor.rediscover_device()?;

        tracing::debug!(
            descriptor = %descriptor.path.display(),
            layers = descriptor.state.layers.len(),
            bound = descriptor.bound.is_some(),
            "Opened descriptor"
        );
        Ok(descriptor)
    }

    /// Release the descriptor and its store lock.
    ///
    /// A bound device is left attached and stays usable by other processes;
    /// a later `open` picks it up again.
    pub fn close(self) {
        if let Some(bound) = &self.bound {
            tracing::info!(
                descriptor = %self.path.display(),
                device = %bound.device,
                "Closing descriptor with device still bound"
            );
        } else {
            tracing::debug!(descriptor = %self.path.display(), "Closing descriptor");
        }
    }

    /// Write the current state to disk.
    pub fn persist(&mut self) -> DeltaResult<()> {
        self.ensure_usable()?;
        self.state.save(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image directory: relative layer paths resolve against it.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn geometry(&self) -> &Geometry {
        &self.state.geometry
    }

    pub fn layers(&self) -> &[Layer] {
        &self.state.layers
    }

    pub fn top_layer(&self) -> DeltaResult<&Layer> {
        self.state.top_layer()
    }

    /// Active chain, base first.
    pub fn active_chain(&self) -> DeltaResult<Vec<&Layer>> {
        self.state.active_chain()
    }

    /// Absolute paths of the active chain, base first.
    pub fn active_chain_paths(&self) -> DeltaResult<Vec<PathBuf>> {
        Ok(self
            .state
            .active_chain()?
            .into_iter()
            .map(|l| self.resolve(&l.path))
            .collect())
    }

    /// Every named snapshot, on the active chain or not.
    pub fn snapshots(&self) -> Vec<&Layer> {
        self.state
            .layers
            .iter()
            .filter(|l| l.uuid.is_some())
            .collect()
    }

    pub fn find_snapshot(&self, uuid: &SnapshotId) -> DeltaResult<&Layer> {
        self.state
            .find_by_uuid(uuid)
            .ok_or_else(|| DeltaError::NotFound(format!("snapshot {} not found", uuid)))
    }

    pub fn bound_device(&self) -> Option<&BoundDevice> {
        self.bound.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn ImageBackend> {
        &self.backend
    }

    /// True after a failed rollback left the backend out of sync with
    /// the persisted state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Absolute location of a layer path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_in(&self.dir, path)
    }

    /// Path as it should be recorded: relative when inside the image
    /// directory, absolute otherwise.
    pub(crate) fn to_stored(&self, path: &Path) -> PathBuf {
        let absolute = self.resolve(path);
        match absolute.strip_prefix(&self.dir) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => absolute,
        }
    }

    pub(crate) fn ensure_usable(&self) -> DeltaResult<()> {
        match &self.poisoned {
            Some(reason) => Err(DeltaError::InvalidState(format!(
                "descriptor {} must be reopened: {}",
                self.path.display(),
                reason
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn poison(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(
            descriptor = %self.path.display(),
            reason = %reason,
            "Descriptor poisoned"
        );
        self.poisoned = Some(reason);
    }

    /// Persist a staged state and make it current.
    ///
    /// On failure the current state is left untouched.
    pub(crate) fn commit(&mut self, mut staged: ChainState) -> DeltaResult<()> {
        staged.normalize();
        staged.validate().map_err(|e| {
            DeltaError::Internal(format!("staged chain state is invalid: {}", e))
        })?;
        staged.save(&self.path)?;
        self.state = staged;
        Ok(())
    }

    /// Best-effort removal of a file no longer referenced by the state.
    pub(crate) fn discard_file(&self, path: &Path) {
        discard_image(self.backend.as_ref(), &self.resolve(path));
    }

    fn rediscover_device(&self) -> DeltaResult<Option<BoundDevice>> {
        for layer in self.state.layers.iter().rev() {
            if let Some(attachment) = self.backend.find_attached(&self.resolve(&layer.path))? {
                tracing::info!(
                    device = %attachment.device,
                    layer = %layer.path.display(),
                    "Found device bound by an earlier process"
                );
                return Ok(Some(BoundDevice {
                    device: attachment.device,
                    layer: layer.id,
                    mount_point: attachment.mount_point,
                    read_only: attachment.read_only,
                }));
            }
        }
        Ok(None)
    }
}

fn resolve_in(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn discard_image(backend: &dyn ImageBackend, path: &Path) {
    if let Err(e) = backend.remove_image(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove image file");
    }
}
