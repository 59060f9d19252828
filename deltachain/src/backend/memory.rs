//! In-process image engine.
//!
//! Keeps every image as a sparse map of block index to block value and
//! models devices, mounts and the inner filesystem's size and usage. Live
//! chain changes are supported. Test helpers write blocks, compute
//! content checksums and inject one-shot failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use deltachain_shared::errors::{DeltaError, DeltaResult};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{
    Attachment, DeviceNode, DeviceStatus, FsMountRequest, FsStats, ImageBackend, ImageGeometry,
};
use crate::constants::fs::DEFAULT_FS_BLOCK_SIZE;
use crate::constants::geometry::{DEFAULT_BLOCK_SIZE_SECTORS, MEMORY_FORMAT_VERSION};
use crate::constants::units::{SECTOR_SIZE, kb_to_sectors};
use crate::descriptor::ImageMode;

static NEXT_BACKEND: AtomicU64 = AtomicU64::new(0);

/// Operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    KernelSupport,
    CreateImage,
    CreateDelta,
    Attach,
    MountFs,
    Rename,
    SwapLayer,
    Fold,
    ResizeFs,
}

#[derive(Debug, Clone)]
struct MemImage {
    size_sectors: u64,
    /// Size of the inner filesystem when this image is a chain's top.
    fs_sectors: u64,
    blocks: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone)]
struct MemDevice {
    layers: Vec<PathBuf>,
    read_only: bool,
    mount_point: Option<PathBuf>,
}

impl MemDevice {
    fn top(&self) -> Option<&PathBuf> {
        self.layers.last()
    }
}

#[derive(Debug, Default)]
struct MemState {
    images: HashMap<PathBuf, MemImage>,
    devices: BTreeMap<String, MemDevice>,
    next_device: u32,
    fs_used_sectors: u64,
    busy_mounts: HashSet<PathBuf>,
    unknown_devices: HashSet<String>,
    failures: HashSet<FailPoint>,
    kernel_loads: usize,
}

impl MemState {
    fn take_failure(&mut self, point: FailPoint) -> bool {
        self.failures.remove(&point)
    }

    fn image(&self, path: &Path) -> DeltaResult<&MemImage> {
        self.images
            .get(path)
            .ok_or_else(|| DeltaError::NotFound(format!("image {} does not exist", path.display())))
    }

    fn image_mut(&mut self, path: &Path) -> DeltaResult<&mut MemImage> {
        self.images
            .get_mut(path)
            .ok_or_else(|| DeltaError::NotFound(format!("image {} does not exist", path.display())))
    }

    fn device(&self, device: &DeviceNode) -> DeltaResult<&MemDevice> {
        self.devices
            .get(device.as_str())
            .ok_or_else(|| DeltaError::NotFound(format!("device {} is not attached", device)))
    }

    fn device_mut(&mut self, device: &DeviceNode) -> DeltaResult<&mut MemDevice> {
        self.devices
            .get_mut(device.as_str())
            .ok_or_else(|| DeltaError::NotFound(format!("device {} is not attached", device)))
    }

    fn device_top(&self, device: &DeviceNode) -> DeltaResult<PathBuf> {
        self.device(device)?
            .top()
            .cloned()
            .ok_or_else(|| DeltaError::Internal(format!("device {} has no layers", device)))
    }

    fn in_use(&self, path: &Path) -> bool {
        self.devices
            .values()
            .any(|d| d.layers.iter().any(|l| l == path))
    }

    fn merged_blocks(&self, chain: &[PathBuf]) -> DeltaResult<BTreeMap<u64, u64>> {
        let mut merged = BTreeMap::new();
        for path in chain {
            merged.extend(self.image(path)?.blocks.iter().map(|(k, v)| (*k, *v)));
        }
        Ok(merged)
    }
}

/// Image engine that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    state: Mutex<MemState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// New engine with a process-unique name.
    pub fn new() -> Self {
        let id = NEXT_BACKEND.fetch_add(1, Ordering::Relaxed);
        Self::with_name(format!("memory-{}", id))
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemState::default()),
        }
    }

    /// Make the next call of `point` fail.
    pub fn fail_once(&self, point: FailPoint) {
        self.state.lock().failures.insert(point);
    }

    /// Number of `ensure_kernel_support` calls, failed ones included.
    pub fn kernel_loads(&self) -> usize {
        self.state.lock().kernel_loads
    }

    pub fn attached_devices(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Number of image files the engine holds.
    pub fn stored_images(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Space the inner filesystem reports as used.
    pub fn set_fs_used_kb(&self, kb: u64) {
        self.state.lock().fs_used_sectors = kb_to_sectors(kb).unwrap_or(u64::MAX);
    }

    /// Mark a mount point as having open files.
    pub fn set_fs_busy(&self, target: &Path, busy: bool) {
        let mut state = self.state.lock();
        if busy {
            state.busy_mounts.insert(target.to_path_buf());
        } else {
            state.busy_mounts.remove(target);
        }
    }

    /// Make `device_status` report `Unknown` for a device.
    pub fn set_status_unknown(&self, device: &DeviceNode, unknown: bool) {
        let mut state = self.state.lock();
        if unknown {
            state.unknown_devices.insert(device.as_str().to_string());
        } else {
            state.unknown_devices.remove(device.as_str());
        }
    }

    pub fn image_size_sectors(&self, path: &Path) -> Option<u64> {
        self.state.lock().images.get(path).map(|i| i.size_sectors)
    }

    /// Filesystem size on the chain attached to `device`.
    pub fn fs_size_sectors(&self, device: &DeviceNode) -> Option<u64> {
        let state = self.state.lock();
        let top = state.device_top(device).ok()?;
        state.images.get(&top).map(|i| i.fs_sectors)
    }

    /// Copy an image to a new path, as a storage migration would.
    pub fn clone_image(&self, from: &Path, to: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        let image = state.image(from)?.clone();
        if state.images.contains_key(to) {
            return Err(DeltaError::AlreadyExists(format!(
                "image {} already exists",
                to.display()
            )));
        }
        state.images.insert(to.to_path_buf(), image);
        Ok(())
    }

    /// Write through a device into its top layer.
    pub fn write_block(&self, device: &DeviceNode, block: u64, value: u64) -> DeltaResult<()> {
        let mut state = self.state.lock();
        let dev = state.device(device)?;
        if dev.read_only {
            return Err(DeltaError::Storage(format!("device {} is read-only", device)));
        }
        let top = state.device_top(device)?;
        Self::put_block(state.image_mut(&top)?, &top, block, value)
    }

    /// Write directly into an image file.
    pub fn write_image_block(&self, path: &Path, block: u64, value: u64) -> DeltaResult<()> {
        let mut state = self.state.lock();
        Self::put_block(state.image_mut(path)?, path, block, value)
    }

    /// Read a block through a device's chain.
    pub fn read_block(&self, device: &DeviceNode, block: u64) -> DeltaResult<Option<u64>> {
        let state = self.state.lock();
        let dev = state.device(device)?;
        for layer in dev.layers.iter().rev() {
            if let Some(value) = state.image(layer)?.blocks.get(&block) {
                return Ok(Some(*value));
            }
        }
        Ok(None)
    }

    /// SHA-256 over the merged content of a chain, base first.
    pub fn content_checksum(&self, chain: &[PathBuf]) -> DeltaResult<String> {
        let state = self.state.lock();
        let merged = state.merged_blocks(chain)?;
        let mut hasher = Sha256::new();
        for (block, value) in merged {
            hasher.update(block.to_le_bytes());
            hasher.update(value.to_le_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Checksum of what a device currently reads.
    pub fn device_checksum(&self, device: &DeviceNode) -> DeltaResult<String> {
        let layers = self.state.lock().device(device)?.layers.clone();
        self.content_checksum(&layers)
    }

    fn put_block(image: &mut MemImage, path: &Path, block: u64, value: u64) -> DeltaResult<()> {
        if block >= image.size_sectors {
            return Err(DeltaError::InvalidArgument(format!(
                "block {} beyond end of {}",
                block,
                path.display()
            )));
        }
        image.blocks.insert(block, value);
        Ok(())
    }

    fn injected(point: FailPoint) -> DeltaError {
        DeltaError::Storage(format!("injected failure at {:?}", point))
    }
}

impl ImageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_kernel_support(&self) -> DeltaResult<()> {
        let mut state = self.state.lock();
        state.kernel_loads += 1;
        if state.take_failure(FailPoint::KernelSupport) {
            return Err(Self::injected(FailPoint::KernelSupport));
        }
        Ok(())
    }

    fn create_image(&self, path: &Path, mode: ImageMode, size_sectors: u64) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateImage) {
            return Err(Self::injected(FailPoint::CreateImage));
        }
        if state.images.contains_key(path) {
            return Err(DeltaError::AlreadyExists(format!(
                "image {} already exists",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), %mode, size_sectors, "Creating memory image");
        state.images.insert(
            path.to_path_buf(),
            MemImage {
                size_sectors,
                fs_sectors: size_sectors,
                blocks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn create_delta(&self, path: &Path, parent: &Path, size_sectors: u64) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::CreateDelta) {
            return Err(Self::injected(FailPoint::CreateDelta));
        }
        let fs_sectors = state.image(parent)?.fs_sectors;
        if state.images.contains_key(path) {
            return Err(DeltaError::AlreadyExists(format!(
                "image {} already exists",
                path.display()
            )));
        }
        state.images.insert(
            path.to_path_buf(),
            MemImage {
                size_sectors,
                fs_sectors,
                blocks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn image_exists(&self, path: &Path) -> bool {
        self.state.lock().images.contains_key(path)
    }

    fn remove_image(&self, path: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.in_use(path) {
            return Err(DeltaError::Busy(format!(
                "image {} is attached",
                path.display()
            )));
        }
        state
            .images
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| DeltaError::NotFound(format!("image {} does not exist", path.display())))
    }

    fn rename_image(&self, from: &Path, to: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::Rename) {
            return Err(DeltaError::io(
                format!("failed to rename {} to {}", from.display(), to.display()),
                io::Error::other("injected rename failure"),
            ));
        }
        let image = state
            .images
            .remove(from)
            .ok_or_else(|| DeltaError::NotFound(format!("image {} does not exist", from.display())))?;
        state.images.insert(to.to_path_buf(), image);

        // Open devices follow the inode, not the name.
        for device in state.devices.values_mut() {
            for layer in device.layers.iter_mut() {
                if layer == from {
                    *layer = to.to_path_buf();
                }
            }
        }
        Ok(())
    }

    fn fold_into_child(
        &self,
        lower: &Path,
        child: &Path,
        new_parent: Option<&Path>,
        live: Option<&DeviceNode>,
    ) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::Fold) {
            return Err(Self::injected(FailPoint::Fold));
        }
        if let Some(parent) = new_parent {
            state.image(parent)?;
        }
        let lower_blocks = state.image(lower)?.blocks.clone();
        state.image(child)?;

        match live {
            Some(device) => {
                let dev = state.device_mut(device)?;
                let index = dev.layers.iter().position(|l| l == lower).ok_or_else(|| {
                    DeltaError::InvalidState(format!(
                        "{} is not part of device {}",
                        lower.display(),
                        device
                    ))
                })?;
                dev.layers.remove(index);
            }
            None if state.in_use(lower) => {
                return Err(DeltaError::Busy(format!(
                    "image {} is attached",
                    lower.display()
                )));
            }
            None => {}
        }

        let target = state.image_mut(child)?;
        for (block, value) in lower_blocks {
            target.blocks.entry(block).or_insert(value);
        }
        Ok(())
    }

    fn resize_image(
        &self,
        path: &Path,
        size_sectors: u64,
        live: Option<&DeviceNode>,
    ) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if let Some(device) = live {
            state.device(device)?;
        }
        let image = state.image_mut(path)?;
        if size_sectors < image.fs_sectors {
            return Err(DeltaError::Storage(format!(
                "shrinking {} to {} sectors would cut the filesystem ({} sectors)",
                path.display(),
                size_sectors,
                image.fs_sectors
            )));
        }
        image.blocks.retain(|block, _| *block < size_sectors);
        image.size_sectors = size_sectors;
        Ok(())
    }

    fn read_image_geometry(&self, path: &Path) -> DeltaResult<ImageGeometry> {
        let state = self.state.lock();
        let image = state.image(path)?;
        Ok(ImageGeometry {
            size_sectors: image.size_sectors,
            block_size_sectors: DEFAULT_BLOCK_SIZE_SECTORS,
            format_version: MEMORY_FORMAT_VERSION,
        })
    }

    fn attach_layers(
        &self,
        layers: &[PathBuf],
        top_index: usize,
        read_only: bool,
    ) -> DeltaResult<DeviceNode> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::Attach) {
            return Err(Self::injected(FailPoint::Attach));
        }
        if top_index >= layers.len() {
            return Err(DeltaError::InvalidArgument(format!(
                "top index {} outside a chain of {} layers",
                top_index,
                layers.len()
            )));
        }
        let chain = layers[..=top_index].to_vec();
        for layer in &chain {
            state.image(layer)?;
        }
        let top = &chain[top_index];
        if state
            .devices
            .values()
            .any(|d| d.top() == Some(top) && !d.read_only)
        {
            return Err(DeltaError::Busy(format!(
                "{} is already attached writable",
                top.display()
            )));
        }

        let node = format!("/dev/memdelta{}", state.next_device);
        state.next_device += 1;
        state.devices.insert(
            node.clone(),
            MemDevice {
                layers: chain,
                read_only,
                mount_point: None,
            },
        );
        Ok(DeviceNode::new(node))
    }

    fn push_top_layer(&self, device: &DeviceNode, path: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        state.image(path)?;
        state.device_mut(device)?.layers.push(path.to_path_buf());
        Ok(())
    }

    fn pop_top_layer(&self, device: &DeviceNode) -> DeltaResult<()> {
        let mut state = self.state.lock();
        let dev = state.device_mut(device)?;
        if dev.layers.len() < 2 {
            return Err(DeltaError::InvalidState(format!(
                "device {} has no pushed layer",
                device
            )));
        }
        dev.layers.pop();
        Ok(())
    }

    fn swap_layer(&self, device: &DeviceNode, level: usize, path: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::SwapLayer) {
            return Err(Self::injected(FailPoint::SwapLayer));
        }
        state.image(path)?;
        let dev = state.device_mut(device)?;
        let slot = dev.layers.get_mut(level).ok_or_else(|| {
            DeltaError::InvalidArgument(format!("device {} has no level {}", device, level))
        })?;
        *slot = path.to_path_buf();
        Ok(())
    }

    fn detach(&self, device: &DeviceNode) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if let Some(mount_point) = &state.device(device)?.mount_point {
            return Err(DeltaError::Busy(format!(
                "device {} is mounted at {}",
                device,
                mount_point.display()
            )));
        }
        state.devices.remove(device.as_str());
        Ok(())
    }

    fn device_status(&self, device: &DeviceNode) -> DeviceStatus {
        let state = self.state.lock();
        if state.unknown_devices.contains(device.as_str()) {
            DeviceStatus::Unknown
        } else if state.devices.contains_key(device.as_str()) {
            DeviceStatus::Attached
        } else {
            DeviceStatus::Detached
        }
    }

    fn find_attached(&self, layer: &Path) -> DeltaResult<Option<Attachment>> {
        let state = self.state.lock();
        Ok(state
            .devices
            .iter()
            .find(|(_, d)| d.top().map(PathBuf::as_path) == Some(layer))
            .map(|(node, d)| Attachment {
                device: DeviceNode::new(node.clone()),
                layer: layer.to_path_buf(),
                mount_point: d.mount_point.clone(),
                read_only: d.read_only,
            }))
    }

    fn mount_fs(&self, device: &DeviceNode, request: &FsMountRequest) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::MountFs) {
            return Err(DeltaError::MountFailed(format!(
                "injected failure mounting {} at {}",
                device,
                request.target.display()
            )));
        }
        if state
            .devices
            .values()
            .any(|d| d.mount_point.as_ref() == Some(&request.target))
        {
            return Err(DeltaError::Busy(format!(
                "{} is already a mount point",
                request.target.display()
            )));
        }
        tracing::debug!(
            device = %device,
            target = %request.target.display(),
            fsck = request.fsck,
            quota = request.quota,
            read_only = request.read_only,
            "Mounting memory filesystem"
        );
        state.device_mut(device)?.mount_point = Some(request.target.clone());
        Ok(())
    }

    fn unmount_fs(&self, target: &Path) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.busy_mounts.contains(target) {
            return Err(DeltaError::Busy(format!("{} has open files", target.display())));
        }
        let device = state
            .devices
            .values_mut()
            .find(|d| d.mount_point.as_deref() == Some(target))
            .ok_or_else(|| DeltaError::NotMounted(format!("{} is not mounted", target.display())))?;
        device.mount_point = None;
        Ok(())
    }

    fn stat_fs(&self, target: &Path) -> DeltaResult<FsStats> {
        let state = self.state.lock();
        let top = state
            .devices
            .values()
            .find(|d| d.mount_point.as_deref() == Some(target))
            .and_then(|d| d.top().cloned())
            .ok_or_else(|| DeltaError::NotMounted(format!("{} is not mounted", target.display())))?;
        let fs_sectors = state.image(&top)?.fs_sectors;

        let sectors_per_block = DEFAULT_FS_BLOCK_SIZE / SECTOR_SIZE;
        let blocks = fs_sectors / sectors_per_block;
        let used = state.fs_used_sectors.div_ceil(sectors_per_block).min(blocks);
        let inodes = blocks / 4;
        Ok(FsStats {
            block_size: DEFAULT_FS_BLOCK_SIZE,
            blocks,
            blocks_free: blocks - used,
            inodes,
            inodes_free: inodes.saturating_sub(11),
        })
    }

    fn fs_min_sectors(&self, device: &DeviceNode) -> DeltaResult<u64> {
        let state = self.state.lock();
        state.device(device)?;
        Ok(state.fs_used_sectors)
    }

    fn resize_fs(
        &self,
        device: &DeviceNode,
        target: Option<&Path>,
        size_sectors: u64,
    ) -> DeltaResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::ResizeFs) {
            return Err(Self::injected(FailPoint::ResizeFs));
        }
        let top = state.device_top(device)?;
        let image = state.image(&top)?;
        let shrinking = size_sectors < image.fs_sectors;

        if shrinking && target.is_some_and(|t| state.busy_mounts.contains(t)) {
            return Err(DeltaError::Busy(format!(
                "filesystem on {} has open files",
                device
            )));
        }
        if size_sectors < state.fs_used_sectors {
            return Err(DeltaError::Storage(format!(
                "filesystem on {} uses {} sectors",
                device, state.fs_used_sectors
            )));
        }
        if size_sectors > image.size_sectors {
            return Err(DeltaError::Storage(format!(
                "filesystem of {} sectors does not fit device {} ({} sectors)",
                size_sectors, device, image.size_sectors
            )));
        }
        state.image_mut(&top)?.fs_sectors = size_sectors;
        Ok(())
    }
}
