//! Device binder.
//!
//! Attaches a descriptor's chain to a block device node, optionally mounts
//! the inner filesystem on it, and reverses both on unmount.

mod guard;
pub mod kernel;

use std::path::PathBuf;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::backend::{DeviceNode, DeviceStatus, FsMountRequest};
use crate::descriptor::{Descriptor, LayerId};
use crate::snapshot_id::SnapshotId;

pub use guard::AttachGuard;

/// Options for [`Descriptor::mount`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Layer to expose. `None` exposes the top layer.
    pub uuid: Option<SnapshotId>,
    /// Mount point. `None` attaches the device without mounting.
    pub target: Option<PathBuf>,
    /// Raw `MS_*` mount flags.
    pub flags: u64,
    /// Auxiliary mount data.
    pub data: String,
    pub read_only: bool,
    /// Check the filesystem before mounting.
    pub fsck: bool,
    pub quota: bool,
}

impl MountOptions {
    pub fn device_only() -> Self {
        Self::default()
    }

    pub fn at(target: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }
}

/// Device currently attached to a descriptor's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDevice {
    pub device: DeviceNode,
    /// Layer exposed as the device's top.
    pub layer: LayerId,
    pub mount_point: Option<PathBuf>,
    pub read_only: bool,
}

impl Descriptor {
    /// Attach the chain ending at the selected layer and mount it.
    ///
    /// A snapshot other than the top is attached read-only.
    pub fn mount(&mut self, options: &MountOptions) -> DeltaResult<DeviceNode> {
        self.ensure_usable()?;
        if let Some(bound) = &self.bound {
            return Err(DeltaError::Busy(format!(
                "device {} is already bound",
                bound.device
            )));
        }

        let target = match &options.uuid {
            Some(uuid) => self.find_snapshot(uuid)?.id(),
            None => self.state.top,
        };
        let read_only = options.read_only || target != self.state.top;
        let layers: Vec<PathBuf> = self
            .state
            .ancestry(target)?
            .into_iter()
            .map(|id| {
                self.state
                    .expect_layer(id)
                    .map(|layer| self.resolve(layer.path()))
            })
            .collect::<DeltaResult<_>>()?;

        kernel::ensure_loaded(self.backend.as_ref())?;

        let guard = AttachGuard::attach(self.backend.as_ref(), &layers, read_only)?;
        let device = guard
            .device()
            .cloned()
            .ok_or_else(|| DeltaError::Internal("attach guard lost its device".to_string()))?;

        if let Some(mount_point) = &options.target {
            let request = FsMountRequest {
                target: mount_point.clone(),
                flags: options.flags,
                data: options.data.clone(),
                read_only,
                fsck: options.fsck,
                quota: options.quota,
            };
            // Dropping the guard on error detaches the device again.
            self.backend.mount_fs(&device, &request)?;
        }
        guard.disarm();

        tracing::info!(
            descriptor = %self.path().display(),
            device = %device,
            layers = layers.len(),
            read_only,
            mount_point = ?options.target,
            "Bound device"
        );

        self.bound = Some(BoundDevice {
            device: device.clone(),
            layer: target,
            mount_point: options.target.clone(),
            read_only,
        });
        Ok(device)
    }

    /// Unmount the filesystem (if any) and detach the device.
    ///
    /// A busy filesystem is reported as `Busy` and the device stays bound.
    pub fn unmount(&mut self) -> DeltaResult<()> {
        self.ensure_usable()?;
        let Some(bound) = self.bound.as_mut() else {
            return Err(DeltaError::NotBound(format!(
                "no device bound for {}",
                self.path().display()
            )));
        };

        if let Some(mount_point) = &bound.mount_point {
            self.backend.unmount_fs(mount_point)?;
            tracing::debug!(mount_point = %mount_point.display(), "Unmounted filesystem");
            bound.mount_point = None;
        }

        self.backend.detach(&bound.device)?;
        tracing::info!(device = %bound.device, "Detached device");
        self.bound = None;
        Ok(())
    }

    /// Whether the bound device is still attached.
    ///
    /// An engine that cannot tell is reported as `InvalidState`.
    pub fn is_mounted(&self) -> DeltaResult<bool> {
        let Some(bound) = &self.bound else {
            return Ok(false);
        };

        match self.backend.device_status(&bound.device) {
            DeviceStatus::Attached => Ok(true),
            DeviceStatus::Detached => Ok(false),
            DeviceStatus::Unknown => Err(DeltaError::InvalidState(format!(
                "state of device {} is indeterminate",
                bound.device
            ))),
        }
    }

    /// Device node of the bound layer, when it is `layer` or one of its
    /// descendants on the attached chain.
    pub(crate) fn live_device_for(&self, layer: LayerId) -> DeltaResult<Option<(DeviceNode, usize)>> {
        let Some(bound) = &self.bound else {
            return Ok(None);
        };
        let chain = self.state.ancestry(bound.layer)?;
        Ok(chain
            .iter()
            .position(|id| *id == layer)
            .map(|index| (bound.device.clone(), index)))
    }
}
