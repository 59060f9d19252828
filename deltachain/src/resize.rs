//! Resizer.
//!
//! Online resize works on the bound device and its mounted filesystem.
//! Offline resize attaches the chain for the duration of the filesystem
//! step. Either way the filesystem shrinks before the image and grows
//! after it, and the new geometry is persisted last.

use std::path::PathBuf;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::backend::DeviceNode;
use crate::constants::units::{kb_to_sectors, sectors_to_kb};
use crate::descriptor::Descriptor;
use crate::device::{AttachGuard, kernel};

impl Descriptor {
    /// Change the logical size to `new_size_kb`.
    ///
    /// Online (`offline == false`) needs a bound device exposing the top
    /// layer. Offline needs no device bound. A shrink below the
    /// filesystem's used size fails with `WouldTruncateData`; a busy
    /// filesystem fails immediately rather than waiting.
    pub fn resize(&mut self, new_size_kb: u64, offline: bool) -> DeltaResult<()> {
        self.ensure_usable()?;
        if new_size_kb == 0 {
            return Err(DeltaError::InvalidArgument(
                "new size must be greater than zero".to_string(),
            ));
        }
        let to = kb_to_sectors(new_size_kb).ok_or_else(|| {
            DeltaError::InvalidArgument(format!("size {} KB is too large", new_size_kb))
        })?;

        let online = if offline {
            if let Some(bound) = &self.bound {
                return Err(DeltaError::Busy(format!(
                    "offline resize while device {} is bound",
                    bound.device
                )));
            }
            None
        } else {
            let bound = self.bound.as_ref().ok_or_else(|| {
                DeltaError::InvalidState("online resize needs a bound device".to_string())
            })?;
            if bound.layer != self.state.top {
                return Err(DeltaError::InvalidState(format!(
                    "device {} does not expose the top layer",
                    bound.device
                )));
            }
            Some((bound.device.clone(), bound.mount_point.clone()))
        };

        let from = self.state.geometry.size_sectors;
        if from == to {
            tracing::debug!(size_kb = new_size_kb, "Resize to current size, nothing to do");
            return Ok(());
        }

        tracing::info!(
            descriptor = %self.path().display(),
            from_kb = sectors_to_kb(from),
            to_kb = new_size_kb,
            online = online.is_some(),
            "Resizing"
        );
        self.apply_resize(from, to, online.as_ref())?;

        let mut staged = self.state.clone();
        staged.geometry.size_sectors = to;
        if let Err(e) = self.commit(staged) {
            if let Err(undo) = self.apply_resize(to, from, online.as_ref()) {
                self.poison(format!(
                    "image left at {} KB after failed persist: {}",
                    new_size_kb, undo
                ));
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_resize(
        &self,
        from: u64,
        to: u64,
        online: Option<&(DeviceNode, Option<PathBuf>)>,
    ) -> DeltaResult<()> {
        let top = self.resolve(self.state.top_layer()?.path());
        let backend = self.backend.as_ref();

        match online {
            Some((device, mount_point)) => {
                if to < from {
                    check_fits(backend.fs_min_sectors(device)?, to)?;
                    backend.resize_fs(device, mount_point.as_deref(), to)?;
                    backend.resize_image(&top, to, Some(device))?;
                } else {
                    backend.resize_image(&top, to, Some(device))?;
                    if let Err(e) = backend.resize_fs(device, mount_point.as_deref(), to) {
                        backend.resize_image(&top, from, Some(device))?;
                        return Err(e);
                    }
                }
            }
            None => {
                kernel::ensure_loaded(backend)?;
                let chain = self.active_chain_paths()?;

                if to < from {
                    let guard = AttachGuard::attach(backend, &chain, false)?;
                    let device = guard.device().cloned().ok_or_else(|| {
                        DeltaError::Internal("attach guard lost its device".to_string())
                    })?;
                    check_fits(backend.fs_min_sectors(&device)?, to)?;
                    backend.resize_fs(&device, None, to)?;
                    guard.release()?;
                    backend.resize_image(&top, to, None)?;
                } else {
                    backend.resize_image(&top, to, None)?;
                    let grown = AttachGuard::attach(backend, &chain, false).and_then(|guard| {
                        let device = guard.device().cloned().ok_or_else(|| {
                            DeltaError::Internal("attach guard lost its device".to_string())
                        })?;
                        backend.resize_fs(&device, None, to)?;
                        guard.release()
                    });
                    if let Err(e) = grown {
                        backend.resize_image(&top, from, None)?;
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_fits(min_sectors: u64, requested_sectors: u64) -> DeltaResult<()> {
    if requested_sectors < min_sectors {
        return Err(DeltaError::WouldTruncateData {
            required_kb: min_sectors.div_ceil(2),
            requested_kb: sectors_to_kb(requested_sectors),
        });
    }
    Ok(())
}
