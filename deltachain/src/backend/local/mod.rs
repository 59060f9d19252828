//! Host engine: qcow2 deltas served by `qemu-nbd`, ext4 inside.
//!
//! The base image is raw or qcow2; every delta is a qcow2 file whose
//! backing file is its parent. Attaching a chain serves its top through
//! `qemu-nbd`, which follows the backing files down to the base.
//!
//! `qemu-nbd` cannot change the backing chain of a served image. Live
//! chain edits therefore take the device down for the edit: the inner
//! filesystem is unmounted, the server is stopped, the files are changed
//! and the same node is reconnected and remounted with its old options.
//! A filesystem that cannot be unmounted reports `Busy` and nothing
//! changes.

mod ext4;
mod image;
mod nbd;
mod qcow2;
mod run;

use std::path::{Path, PathBuf};
use std::process::Command;

use deltachain_shared::errors::{DeltaError, DeltaResult};
use nix::errno::Errno;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

use super::{
    Attachment, DeviceNode, DeviceStatus, FsMountRequest, FsStats, ImageBackend, ImageGeometry,
};
use crate::constants::envs;
use crate::constants::fs::DEFAULT_FS_TYPE;
use crate::constants::geometry::{DEFAULT_BLOCK_SIZE_SECTORS, RAW_FORMAT_VERSION};
use crate::constants::units::SECTOR_SIZE;
use crate::descriptor::ImageMode;
use crate::device::{AttachGuard, kernel};

pub use image::ImageFormat;

const NBD_MODULE_DIR: &str = "/sys/module/nbd";

/// Longest backing chain followed when walking headers.
const MAX_CHAIN_DEPTH: usize = 4096;

/// Tool locations and limits for [`LocalBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub qemu_img: PathBuf,
    pub qemu_nbd: PathBuf,
    /// Filesystem created inside new base images.
    pub fs_type: String,
    /// Number of `/dev/nbdN` nodes to scan.
    pub nbd_max_devices: u32,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
            qemu_nbd: PathBuf::from("qemu-nbd"),
            fs_type: DEFAULT_FS_TYPE.to_string(),
            nbd_max_devices: 16,
        }
    }
}

impl LocalBackendConfig {
    /// Defaults overridden by `DELTACHAIN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(envs::QEMU_IMG) {
            config.qemu_img = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(envs::QEMU_NBD) {
            config.qemu_nbd = PathBuf::from(path);
        }
        if let Ok(fs_type) = std::env::var(envs::FS_TYPE) {
            config.fs_type = fs_type;
        }
        config
    }
}

pub struct LocalBackend {
    config: LocalBackendConfig,
    nbd: nbd::NbdPool,
}

impl LocalBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        let nbd = nbd::NbdPool::new(config.qemu_nbd.clone(), config.nbd_max_devices);
        Self { config, nbd }
    }

    pub fn config(&self) -> &LocalBackendConfig {
        &self.config
    }

    /// Lay the inner filesystem down through a temporary device.
    fn format_through_device(&self, path: &Path) -> DeltaResult<()> {
        kernel::ensure_loaded(self)?;
        let guard = AttachGuard::attach(self, &[path.to_path_buf()], false)?;
        let device = guard
            .device()
            .ok_or_else(|| DeltaError::Internal("attach guard lost its device".to_string()))?;
        ext4::make_fs(&self.config.fs_type, device.as_path())?;
        guard.release()
    }

    /// Point each delta's backing file at the layer below it.
    ///
    /// A chain whose files were renamed or replaced still names the old
    /// paths in its headers; rewrite them before serving.
    fn sync_backing_files(&self, layers: &[PathBuf]) -> DeltaResult<()> {
        for pair in layers.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            let expected = parent.canonicalize().map_err(|e| {
                DeltaError::io(format!("failed to resolve {}", parent.display()), e)
            })?;
            let header = qcow2::read_header(child)?;
            if header.backing_file.as_deref() == Some(expected.as_path()) {
                continue;
            }

            tracing::debug!(
                layer = %child.display(),
                backing = %expected.display(),
                "Rewriting backing file"
            );
            let format = ImageFormat::detect(parent)?;
            run::run(
                Command::new(&self.config.qemu_img)
                    .args(["rebase", "-u", "-f", "qcow2", "-F", format.as_str(), "-b"])
                    .arg(&expected)
                    .arg(child),
                &format!("update backing file of {}", child.display()),
            )?;
        }
        Ok(())
    }

    /// Run `edit` with `device` unmounted and, if `disconnect` is set,
    /// with its server stopped.
    ///
    /// `edit` receives the served top and returns the file to serve
    /// afterwards. If it fails the old top is put back.
    fn with_device_released<T>(
        &self,
        device: &DeviceNode,
        disconnect: bool,
        edit: impl FnOnce(&Path) -> DeltaResult<(T, PathBuf)>,
    ) -> DeltaResult<T> {
        let top = nbd::served_top(device)?;
        let read_only = nbd::is_read_only(device);
        let mount = nbd::mount_entry(device)?;

        if let Some(entry) = &mount {
            self.unmount_fs(&entry.target)?;
        }
        if disconnect && let Err(e) = self.nbd.disconnect(device) {
            self.restore_after_failure(device, None, mount.as_ref(), read_only);
            return Err(e);
        }

        match edit(top.as_path()) {
            Ok((value, next_top)) => {
                self.bring_back(
                    device,
                    disconnect.then_some(next_top.as_path()),
                    mount.as_ref(),
                    read_only,
                )?;
                tracing::debug!(
                    device = %device,
                    top = %next_top.display(),
                    "Device back after live edit"
                );
                Ok(value)
            }
            Err(e) => {
                self.restore_after_failure(
                    device,
                    disconnect.then_some(top.as_path()),
                    mount.as_ref(),
                    read_only,
                );
                Err(e)
            }
        }
    }

    fn bring_back(
        &self,
        device: &DeviceNode,
        top: Option<&Path>,
        mount: Option<&nbd::MountEntry>,
        read_only: bool,
    ) -> DeltaResult<()> {
        if let Some(top) = top {
            self.nbd
                .connect(device, top, ImageFormat::detect(top)?, read_only)?;
        }
        if let Some(entry) = mount {
            remount(device, entry)?;
        }
        Ok(())
    }

    fn restore_after_failure(
        &self,
        device: &DeviceNode,
        top: Option<&Path>,
        mount: Option<&nbd::MountEntry>,
        read_only: bool,
    ) {
        if let Err(e) = self.bring_back(device, top, mount, read_only) {
            tracing::error!(
                device = %device,
                error = %e,
                "Failed to restore device after a failed live edit"
            );
        }
    }

    fn fold_offline(
        &self,
        lower: &Path,
        child: &Path,
        new_parent: Option<&Path>,
    ) -> DeltaResult<()> {
        // Safe-mode rebase copies every cluster that differs between the
        // old and the new backing chain into the child.
        let mut cmd = Command::new(&self.config.qemu_img);
        cmd.args(["rebase", "-q", "-f", "qcow2"]);
        match new_parent {
            Some(parent) => {
                let format = ImageFormat::detect(parent)?;
                cmd.args(["-F", format.as_str(), "-b"]).arg(parent);
            }
            None => {
                cmd.args(["-b", ""]);
            }
        }
        cmd.arg(child);
        run::run(
            &mut cmd,
            &format!("merge {} into {}", lower.display(), child.display()),
        )?;
        Ok(())
    }

    fn resize_offline(&self, path: &Path, size_sectors: u64) -> DeltaResult<()> {
        let size_bytes = size_sectors * SECTOR_SIZE;

        match ImageFormat::detect(path)? {
            ImageFormat::Raw => {
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| DeltaError::io(format!("failed to open {}", path.display()), e))?;
                file.set_len(size_bytes).map_err(|e| {
                    DeltaError::io(format!("failed to resize {}", path.display()), e)
                })?;
            }
            ImageFormat::Qcow2 => {
                let current = qcow2::read_header(path)?.size;
                let mut cmd = Command::new(&self.config.qemu_img);
                cmd.args(["resize", "-q", "-f", "qcow2"]);
                if size_bytes < current {
                    cmd.arg("--shrink");
                }
                cmd.arg(path).arg(size_bytes.to_string());
                run::run(&mut cmd, &format!("resize image {}", path.display()))?;
            }
        }
        Ok(())
    }
}

/// Backing file named in `child`'s header, resolved against its directory.
fn backing_of(child: &Path) -> DeltaResult<Option<PathBuf>> {
    if ImageFormat::detect(child)? == ImageFormat::Raw {
        return Ok(None);
    }
    Ok(qcow2::read_header(child)?.backing_file.map(|backing| {
        match child.parent() {
            Some(dir) if backing.is_relative() => dir.join(backing),
            _ => backing,
        }
    }))
}

/// Files of the chain served from `top`, base first.
fn chain_from_top(top: &Path) -> DeltaResult<Vec<PathBuf>> {
    let mut chain = vec![top.to_path_buf()];
    while let Some(backing) = backing_of(&chain[chain.len() - 1])? {
        if chain.len() >= MAX_CHAIN_DEPTH || chain.contains(&backing) {
            return Err(DeltaError::CorruptData(format!(
                "backing chain of {} does not end in a base image",
                top.display()
            )));
        }
        chain.push(backing);
    }
    chain.reverse();
    Ok(chain)
}

/// Split options as the kernel reports them into mount flags and the
/// filesystem data string.
fn split_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options.split(',').filter(|o| !o.is_empty()) {
        match option {
            "rw" | "seclabel" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "lazytime" => flags |= MsFlags::MS_LAZYTIME,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

fn remount(device: &DeviceNode, entry: &nbd::MountEntry) -> DeltaResult<()> {
    let (flags, data) = split_mount_options(&entry.options);
    nix::mount::mount(
        Some(device.as_path()),
        &entry.target,
        Some(entry.fs_type.as_str()),
        flags,
        (!data.is_empty()).then_some(data.as_str()),
    )
    .map_err(|errno| {
        DeltaError::MountFailed(format!(
            "remount {} on {}: {}",
            device,
            entry.target.display(),
            errno
        ))
    })
}

impl ImageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn ensure_kernel_support(&self) -> DeltaResult<()> {
        if Path::new(NBD_MODULE_DIR).exists() {
            return Ok(());
        }
        tracing::info!("Loading nbd kernel module");
        run::run(
            Command::new("modprobe").args(["nbd", "max_part=0"]),
            "load the nbd kernel module",
        )?;
        Ok(())
    }

    fn create_image(&self, path: &Path, mode: ImageMode, size_sectors: u64) -> DeltaResult<()> {
        if path.exists() {
            return Err(DeltaError::AlreadyExists(format!(
                "image {} already exists",
                path.display()
            )));
        }
        let size_bytes = size_sectors * SECTOR_SIZE;

        let disk = match mode {
            ImageMode::Raw => {
                let file = std::fs::OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| {
                        DeltaError::io(format!("failed to create image {}", path.display()), e)
                    })?;
                let disk = image::Disk::new(path.to_path_buf(), ImageFormat::Raw);
                file.set_len(size_bytes).map_err(|e| {
                    DeltaError::io(format!("failed to size image {}", path.display()), e)
                })?;
                drop(file);
                ext4::make_fs(&self.config.fs_type, disk.path())?;
                disk
            }
            ImageMode::Expanded => {
                let disk = qcow2::create_native(path, size_bytes)?;
                self.format_through_device(disk.path())?;
                disk
            }
            ImageMode::Preallocated => {
                let disk = qcow2::create_preallocated(&self.config.qemu_img, path, size_bytes)?;
                self.format_through_device(disk.path())?;
                disk
            }
        };

        tracing::info!(
            image = %path.display(),
            mode = mode.as_str(),
            format = disk.format().as_str(),
            size_sectors,
            "Created base image"
        );
        disk.leak();
        Ok(())
    }

    fn create_delta(&self, path: &Path, parent: &Path, size_sectors: u64) -> DeltaResult<()> {
        let format = ImageFormat::detect(parent)?;
        qcow2::write_cow_child(path, parent, format, size_sectors * SECTOR_SIZE).map_err(|e| {
            match e {
                DeltaError::Io { source, .. }
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    DeltaError::AlreadyExists(format!("delta {} already exists", path.display()))
                }
                other => other,
            }
        })
    }

    fn image_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn remove_image(&self, path: &Path) -> DeltaResult<()> {
        std::fs::remove_file(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeltaError::NotFound(format!("image {} does not exist", path.display()))
            } else {
                DeltaError::io(format!("failed to remove {}", path.display()), e)
            }
        })
    }

    fn rename_image(&self, from: &Path, to: &Path) -> DeltaResult<()> {
        std::fs::rename(from, to).map_err(|e| {
            DeltaError::io(
                format!("failed to rename {} to {}", from.display(), to.display()),
                e,
            )
        })
    }

    fn fold_into_child(
        &self,
        lower: &Path,
        child: &Path,
        new_parent: Option<&Path>,
        live: Option<&DeviceNode>,
    ) -> DeltaResult<()> {
        match live {
            Some(device) => self.with_device_released(device, true, |top| {
                self.fold_offline(lower, child, new_parent)?;
                Ok(((), top.to_path_buf()))
            })?,
            None => self.fold_offline(lower, child, new_parent)?,
        }

        tracing::info!(
            lower = %lower.display(),
            child = %child.display(),
            new_parent = ?new_parent,
            live = live.is_some(),
            "Merged layer into child"
        );
        Ok(())
    }

    fn resize_image(
        &self,
        path: &Path,
        size_sectors: u64,
        live: Option<&DeviceNode>,
    ) -> DeltaResult<()> {
        match live {
            // The node picks up the new size when it is reconnected.
            Some(device) => self.with_device_released(device, true, |top| {
                self.resize_offline(path, size_sectors)?;
                Ok(((), top.to_path_buf()))
            }),
            None => self.resize_offline(path, size_sectors),
        }
    }

    fn read_image_geometry(&self, path: &Path) -> DeltaResult<ImageGeometry> {
        match ImageFormat::detect(path)? {
            ImageFormat::Qcow2 => {
                let header = qcow2::read_header(path)?;
                Ok(ImageGeometry {
                    size_sectors: header.size / SECTOR_SIZE,
                    block_size_sectors: (header.cluster_size() / SECTOR_SIZE) as u32,
                    format_version: header.version,
                })
            }
            ImageFormat::Raw => {
                let metadata = std::fs::metadata(path)
                    .map_err(|e| DeltaError::io(format!("failed to stat {}", path.display()), e))?;
                Ok(ImageGeometry {
                    size_sectors: metadata.len() / SECTOR_SIZE,
                    block_size_sectors: DEFAULT_BLOCK_SIZE_SECTORS,
                    format_version: RAW_FORMAT_VERSION,
                })
            }
        }
    }

    fn attach_layers(
        &self,
        layers: &[PathBuf],
        top_index: usize,
        read_only: bool,
    ) -> DeltaResult<DeviceNode> {
        let chain = layers.get(..=top_index).ok_or_else(|| {
            DeltaError::InvalidArgument(format!(
                "top index {} outside a chain of {} layers",
                top_index,
                layers.len()
            ))
        })?;
        let top = &chain[top_index];

        if let Some(attachment) = self.find_attached(top)?
            && !(read_only && attachment.read_only)
        {
            return Err(DeltaError::Busy(format!(
                "{} is already attached to {}",
                top.display(),
                attachment.device
            )));
        }

        self.sync_backing_files(chain)?;
        let device = self.nbd.find_free()?;
        self.nbd
            .connect(&device, top, ImageFormat::detect(top)?, read_only)?;
        Ok(device)
    }

    fn push_top_layer(&self, device: &DeviceNode, path: &Path) -> DeltaResult<()> {
        let parent = backing_of(path)?.ok_or_else(|| {
            DeltaError::InvalidArgument(format!("{} has no backing file", path.display()))
        })?;
        self.with_device_released(device, true, |_| {
            self.sync_backing_files(&[parent, path.to_path_buf()])?;
            Ok(((), path.to_path_buf()))
        })?;
        tracing::info!(device = %device, top = %path.display(), "Pushed top layer");
        Ok(())
    }

    fn pop_top_layer(&self, device: &DeviceNode) -> DeltaResult<()> {
        self.with_device_released(device, true, |top| {
            let below = backing_of(top)?.ok_or_else(|| {
                DeltaError::InvalidState(format!("device {} has no pushed layer", device))
            })?;
            Ok(((), below))
        })
    }

    fn swap_layer(&self, device: &DeviceNode, level: usize, path: &Path) -> DeltaResult<()> {
        if !path.is_file() {
            return Err(DeltaError::NotFound(format!(
                "image {} does not exist",
                path.display()
            )));
        }
        self.with_device_released(device, true, |top| {
            let mut chain = chain_from_top(top)?;
            let slot = chain.get_mut(level).ok_or_else(|| {
                DeltaError::InvalidArgument(format!("device {} has no level {}", device, level))
            })?;
            *slot = path.to_path_buf();
            self.sync_backing_files(&chain)?;
            Ok(((), chain[chain.len() - 1].clone()))
        })?;
        tracing::info!(device = %device, level, file = %path.display(), "Swapped layer");
        Ok(())
    }

    fn detach(&self, device: &DeviceNode) -> DeltaResult<()> {
        if nbd::mount_point(device)?.is_some() {
            return Err(DeltaError::Busy(format!("{} is still mounted", device)));
        }
        self.nbd.disconnect(device)
    }

    fn device_status(&self, device: &DeviceNode) -> DeviceStatus {
        nbd::status(device)
    }

    fn find_attached(&self, layer: &Path) -> DeltaResult<Option<Attachment>> {
        let Ok(wanted) = layer.canonicalize() else {
            return Ok(None);
        };

        for (device, pid) in self.nbd.attached() {
            let Some(served) = nbd::served_image(pid) else {
                continue;
            };
            if served.canonicalize().ok().as_deref() != Some(wanted.as_path()) {
                continue;
            }
            return Ok(Some(Attachment {
                mount_point: nbd::mount_point(&device)?,
                read_only: nbd::is_read_only(&device),
                device,
                layer: layer.to_path_buf(),
            }));
        }
        Ok(None)
    }

    fn mount_fs(&self, device: &DeviceNode, request: &FsMountRequest) -> DeltaResult<()> {
        if request.fsck && !request.read_only {
            ext4::check_fs(device.as_path(), false)?;
        }

        let mut flags = MsFlags::from_bits_truncate(request.flags as libc::c_ulong);
        if request.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let data = mount_data(&request.data, request.quota);

        std::fs::create_dir_all(&request.target).map_err(|e| {
            DeltaError::io(
                format!("failed to create mount point {}", request.target.display()),
                e,
            )
        })?;

        nix::mount::mount(
            Some(device.as_path()),
            &request.target,
            Some(self.config.fs_type.as_str()),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|errno| match errno {
            Errno::EBUSY => DeltaError::Busy(format!(
                "{} or {} is busy",
                device,
                request.target.display()
            )),
            other => DeltaError::MountFailed(format!(
                "mount {} on {}: {}",
                device,
                request.target.display(),
                other
            )),
        })?;

        tracing::info!(
            device = %device,
            target = %request.target.display(),
            options = %data,
            "Mounted filesystem"
        );
        Ok(())
    }

    fn unmount_fs(&self, target: &Path) -> DeltaResult<()> {
        nix::mount::umount(target).map_err(|errno| match errno {
            Errno::EBUSY => DeltaError::Busy(format!("{} is busy", target.display())),
            Errno::EINVAL => DeltaError::NotMounted(format!("{} is not mounted", target.display())),
            other => DeltaError::io(
                format!("failed to unmount {}", target.display()),
                std::io::Error::from(other),
            ),
        })
    }

    fn stat_fs(&self, target: &Path) -> DeltaResult<FsStats> {
        let stat = nix::sys::statvfs::statvfs(target).map_err(|errno| match errno {
            Errno::ENOENT => DeltaError::NotFound(format!("{} does not exist", target.display())),
            other => DeltaError::io(
                format!("failed to stat filesystem at {}", target.display()),
                std::io::Error::from(other),
            ),
        })?;

        Ok(FsStats {
            block_size: stat.fragment_size() as u64,
            blocks: stat.blocks() as u64,
            blocks_free: stat.blocks_free() as u64,
            inodes: stat.files() as u64,
            inodes_free: stat.files_free() as u64,
        })
    }

    fn fs_min_sectors(&self, device: &DeviceNode) -> DeltaResult<u64> {
        ext4::min_size_sectors(device.as_path())
    }

    fn resize_fs(
        &self,
        device: &DeviceNode,
        target: Option<&Path>,
        size_sectors: u64,
    ) -> DeltaResult<()> {
        // ext4 only grows while mounted; shrinking goes through an unmount.
        if target.is_some() && size_sectors < nbd::device_sectors(device)? {
            return self.with_device_released(device, false, |top| {
                ext4::check_fs(device.as_path(), true)?;
                ext4::resize_fs(device.as_path(), size_sectors)?;
                Ok(((), top.to_path_buf()))
            });
        }
        // resize2fs insists on a freshly checked filesystem when offline.
        if target.is_none() {
            ext4::check_fs(device.as_path(), true)?;
        }
        ext4::resize_fs(device.as_path(), size_sectors)
    }
}

/// Mount data string with quota options appended.
fn mount_data(data: &str, quota: bool) -> String {
    let mut options: Vec<&str> = data.split(',').filter(|o| !o.is_empty()).collect();
    if quota {
        for option in ["usrquota", "grpquota"] {
            if !options.contains(&option) {
                options.push(option);
            }
        }
    }
    options.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> LocalBackend {
        LocalBackend::new(LocalBackendConfig::default())
    }

    #[test]
    fn test_config_defaults() {
        let config = LocalBackendConfig::default();
        assert_eq!(config.qemu_img, PathBuf::from("qemu-img"));
        assert_eq!(config.fs_type, "ext4");
        assert_eq!(config.nbd_max_devices, 16);
    }

    #[test]
    fn test_config_partial_json() {
        let config: LocalBackendConfig =
            serde_json::from_str(r#"{"qemu_nbd": "/opt/qemu/bin/qemu-nbd"}"#).unwrap();
        assert_eq!(config.qemu_nbd, PathBuf::from("/opt/qemu/bin/qemu-nbd"));
        assert_eq!(config.qemu_img, PathBuf::from("qemu-img"));
    }

    #[test]
    fn test_mount_data() {
        assert_eq!(mount_data("", false), "");
        assert_eq!(mount_data("noatime", false), "noatime");
        assert_eq!(mount_data("noatime", true), "noatime,usrquota,grpquota");
        assert_eq!(mount_data("usrquota", true), "usrquota,grpquota");
    }

    #[test]
    fn test_create_delta_and_geometry() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.img");
        std::fs::write(&base, vec![0u8; 1 << 20]).unwrap();
        let backend = backend();

        let geometry = backend.read_image_geometry(&base).unwrap();
        assert_eq!(geometry.size_sectors, 2048);
        assert_eq!(geometry.block_size_sectors, DEFAULT_BLOCK_SIZE_SECTORS);
        assert_eq!(geometry.format_version, RAW_FORMAT_VERSION);

        let delta = dir.path().join("base.img.1");
        backend.create_delta(&delta, &base, 2048).unwrap();
        let geometry = backend.read_image_geometry(&delta).unwrap();
        assert_eq!(geometry.size_sectors, 2048);
        assert_eq!(geometry.block_size_sectors, 128);
        assert_eq!(geometry.format_version, 3);

        let err = backend.create_delta(&delta, &base, 2048).unwrap_err();
        assert!(matches!(err, DeltaError::AlreadyExists(_)));
    }

    #[test]
    fn test_create_delta_missing_parent() {
        let dir = TempDir::new().unwrap();
        let err = backend()
            .create_delta(&dir.path().join("d"), &dir.path().join("none"), 2048)
            .unwrap_err();
        assert!(matches!(err, DeltaError::NotFound(_)));
    }

    #[test]
    fn test_file_operations() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"a").unwrap();

        assert!(backend.image_exists(&a));
        backend.rename_image(&a, &b).unwrap();
        assert!(!backend.image_exists(&a));
        backend.remove_image(&b).unwrap();
        assert!(matches!(
            backend.remove_image(&b),
            Err(DeltaError::NotFound(_))
        ));
    }

    #[test]
    fn test_resize_raw_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        backend().resize_image(&path, 16, None).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 * 512);
    }

    #[test]
    fn test_live_edits_need_an_attached_device() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.img");
        std::fs::write(&base, vec![0u8; 1 << 20]).unwrap();
        let delta = dir.path().join("base.img.1");
        let backend = backend();
        backend.create_delta(&delta, &base, 2048).unwrap();
        let device = DeviceNode::new("/dev/nbd-does-not-exist");

        assert!(matches!(
            backend.push_top_layer(&device, &delta),
            Err(DeltaError::NotBound(_))
        ));
        assert!(matches!(
            backend.pop_top_layer(&device),
            Err(DeltaError::NotBound(_))
        ));
        assert!(matches!(
            backend.swap_layer(&device, 0, &base),
            Err(DeltaError::NotBound(_))
        ));
        assert!(matches!(
            backend.resize_image(&delta, 4096, Some(&device)),
            Err(DeltaError::NotBound(_))
        ));
        assert!(matches!(
            backend.fold_into_child(&base, &delta, None, Some(&device)),
            Err(DeltaError::NotBound(_))
        ));
        assert_eq!(backend.read_image_geometry(&delta).unwrap().size_sectors, 2048);
        assert_eq!(
            backing_of(&delta).unwrap().map(|p| p.canonicalize().unwrap()),
            Some(base.canonicalize().unwrap())
        );
    }

    #[test]
    fn test_push_of_a_base_image_is_rejected() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.img");
        std::fs::write(&base, vec![0u8; 4096]).unwrap();
        let err = backend()
            .push_top_layer(&DeviceNode::new("/dev/nbd0"), &base)
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidArgument(_)));
    }

    #[test]
    fn test_chain_from_top() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.img");
        std::fs::write(&base, vec![0u8; 1 << 20]).unwrap();
        let mid = dir.path().join("base.img.1");
        let top = dir.path().join("base.img.2");
        let backend = backend();
        backend.create_delta(&mid, &base, 2048).unwrap();
        backend.create_delta(&top, &mid, 2048).unwrap();

        let chain: Vec<PathBuf> = chain_from_top(&top)
            .unwrap()
            .iter()
            .map(|p| p.canonicalize().unwrap())
            .collect();
        let expected: Vec<PathBuf> = [&base, &mid, &top]
            .iter()
            .map(|p| p.canonicalize().unwrap())
            .collect();
        assert_eq!(chain, expected);
        assert_eq!(chain_from_top(&base).unwrap(), vec![base.clone()]);
    }

    #[test]
    fn test_split_mount_options() {
        let (flags, data) = split_mount_options("rw,nosuid,nodev,relatime,seclabel");
        assert_eq!(
            flags,
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RELATIME
        );
        assert_eq!(data, "");

        let (flags, data) =
            split_mount_options("ro,noatime,errors=remount-ro,usrquota,grpquota");
        assert_eq!(flags, MsFlags::MS_RDONLY | MsFlags::MS_NOATIME);
        assert_eq!(data, "errors=remount-ro,usrquota,grpquota");

        let (flags, data) = split_mount_options("");
        assert!(flags.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    fn test_find_attached_missing_layer() {
        let dir = TempDir::new().unwrap();
        let found = backend().find_attached(&dir.path().join("nope")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_attach_bad_top_index() {
        let err = backend()
            .attach_layers(&[PathBuf::from("/tmp/a")], 3, false)
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidArgument(_)));
    }
}
