//! Scoped device attachment.

use deltachain_shared::errors::DeltaResult;

use crate::backend::{DeviceNode, ImageBackend};

/// Detaches a device when dropped unless [`disarm`](Self::disarm)ed.
///
/// Used for attachments that must not outlive a failed operation: the
/// filesystem mount step of `mount` and the temporary attach of an
/// offline resize.
pub struct AttachGuard<'a> {
    backend: &'a dyn ImageBackend,
    device: Option<DeviceNode>,
}

impl<'a> AttachGuard<'a> {
    pub fn new(backend: &'a dyn ImageBackend, device: DeviceNode) -> Self {
        Self {
            backend,
            device: Some(device),
        }
    }

    /// Attach `layers[..=top_index]` and guard the resulting device.
    pub fn attach(
        backend: &'a dyn ImageBackend,
        layers: &[std::path::PathBuf],
        read_only: bool,
    ) -> DeltaResult<Self> {
        let top_index = layers.len().saturating_sub(1);
        let device = backend.attach_layers(layers, top_index, read_only)?;
        Ok(Self::new(backend, device))
    }

    pub fn device(&self) -> Option<&DeviceNode> {
        self.device.as_ref()
    }

    /// Keep the device attached past the guard's scope.
    pub fn disarm(mut self) -> Option<DeviceNode> {
        self.device.take()
    }

    /// Detach now and report the result.
    pub fn release(mut self) -> DeltaResult<()> {
        match self.device.take() {
            Some(device) => self.backend.detach(&device),
            None => Ok(()),
        }
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            match self.backend.detach(&device) {
                Ok(()) => tracing::debug!(device = %device, "Detached guarded device"),
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "Failed to detach guarded device")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceStatus, MemoryBackend};
    use crate::descriptor::ImageMode;
    use std::path::PathBuf;

    fn backend_with_image() -> (MemoryBackend, PathBuf) {
        let backend = MemoryBackend::new();
        let image = PathBuf::from("/img/root.hdd");
        backend.create_image(&image, ImageMode::Expanded, 2048).unwrap();
        (backend, image)
    }

    #[test]
    fn test_drop_detaches() {
        let (backend, image) = backend_with_image();
        let device = {
            let guard = AttachGuard::attach(&backend, &[image], false).unwrap();
            guard.device().cloned().unwrap()
        };
        assert_eq!(backend.device_status(&device), DeviceStatus::Detached);
    }

    #[test]
    fn test_disarm_keeps_device() {
        let (backend, image) = backend_with_image();
        let guard = AttachGuard::attach(&backend, &[image], false).unwrap();
        let device = guard.disarm().unwrap();
        assert_eq!(backend.device_status(&device), DeviceStatus::Attached);
    }
}
