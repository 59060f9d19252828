//! Chain mutator.
//!
//! Snapshot create, switch, delete and layer replace. Each operation:
//! 1. stages the new topology on a clone of the chain state,
//! 2. creates new files and applies live device changes,
//! 3. persists the staged state,
//! 4. only then removes files the new state no longer references.
//!
//! A failure before step 3 completes undoes step 2. When the undo itself
//! fails the descriptor is poisoned.

mod params;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::backend::DeviceNode;
use crate::descriptor::{ChainState, Descriptor, Layer, LayerId};
use crate::snapshot_id::SnapshotId;

pub use params::{LayerSelector, ReplaceParams, SwitchPolicy};

const DELTA_NAME_ATTEMPTS: usize = 8;

impl Descriptor {
    /// Freeze the top layer as a named snapshot and start a new empty top
    /// above it.
    ///
    /// When the bound device exposes the top, the new delta is pushed onto
    /// the live device.
    pub fn create_snapshot(&mut self) -> DeltaResult<SnapshotId> {
        self.ensure_usable()?;

        let mut staged = self.state.clone();
        let old_top = staged.top;
        let (old_top_path, old_level) = {
            let top = staged.top_layer()?;
            (self.resolve(top.path()), top.level())
        };

        let uuid = SnapshotId::generate();
        let delta = self.new_delta_path(&staged)?;
        let delta_abs = self.resolve(&delta);
        self.backend
            .create_delta(&delta_abs, &old_top_path, staged.geometry.size_sectors)?;

        let new_top = staged.alloc_id();
        {
            let frozen = staged.layer_mut(old_top)?;
            frozen.top = false;
            frozen.uuid = Some(uuid);
        }
        staged.layers.push(Layer {
            id: new_top,
            path: delta.clone(),
            uuid: None,
            level: old_level + 1,
            parent: Some(old_top),
            top: true,
        });
        staged.top = new_top;

        let live = self
            .bound
            .as_ref()
            .filter(|bound| bound.layer == old_top)
            .map(|bound| bound.device.clone());

        if let Some(device) = &live
            && let Err(e) = self.backend.push_top_layer(device, &delta_abs)
        {
            self.discard_file(&delta);
            return Err(e);
        }

        if let Err(e) = self.commit(staged) {
            if let Some(device) = &live
                && let Err(pop_err) = self.backend.pop_top_layer(device)
            {
                self.poison(format!(
                    "delta {} stays on device {}: {}",
                    delta_abs.display(),
                    device,
                    pop_err
                ));
                return Err(e);
            }
            self.discard_file(&delta);
            return Err(e);
        }

        if live.is_some()
            && let Some(bound) = self.bound.as_mut()
        {
            bound.layer = new_top;
        }

        tracing::info!(
            snapshot = %uuid,
            delta = %delta.display(),
            live = live.is_some(),
            "Created snapshot"
        );
        Ok(uuid)
    }

    /// Make the snapshot `uuid` the writable top, discarding the old top
    /// and every layer between it and the target.
    ///
    /// The target is promoted in place when nothing else depends on it;
    /// otherwise an empty delta is created above it. The disk takes the
    /// size the target had when it was taken.
    pub fn switch_snapshot(&mut self, uuid: &SnapshotId) -> DeltaResult<()> {
        self.switch_with(uuid, SwitchPolicy::default().reuse_target())
            .map(|_| ())
    }

    /// Switch to `uuid` with explicit control over the old top and the
    /// new top.
    ///
    /// Returns the fresh name of the old top when `keep_old_top` is set.
    pub fn switch_snapshot_ext(
        &mut self,
        uuid: &SnapshotId,
        policy: SwitchPolicy,
    ) -> DeltaResult<Option<SnapshotId>> {
        self.switch_with(uuid, policy)
    }

    /// Remove the snapshot `uuid`.
    ///
    /// A layer with one child is folded into that child; the chain's
    /// content is unchanged and it gets one layer shorter.
    pub fn delete_snapshot(&mut self, uuid: &SnapshotId) -> DeltaResult<()> {
        self.ensure_usable()?;

        let layer = self.find_snapshot(uuid)?.clone();
        if layer.is_top() {
            return Err(DeltaError::InvalidArgument(format!(
                "{} names the top layer",
                uuid
            )));
        }
        if let Some(bound) = &self.bound
            && bound.layer == layer.id
        {
            return Err(DeltaError::Busy(format!(
                "snapshot {} is exposed by device {}",
                uuid, bound.device
            )));
        }

        let mut staged = self.state.clone();
        let mut live = None;
        match staged.children(layer.id).as_slice() {
            [] => {
                staged.remove_layer(layer.id)?;
            }
            [child] => {
                let child = *child;
                let child_path = self.resolve(staged.expect_layer(child)?.path());
                let new_parent = match layer.parent {
                    Some(parent) => Some(self.resolve(staged.expect_layer(parent)?.path())),
                    None => None,
                };
                live = self.live_device_for(layer.id)?.map(|(device, _)| device);

                self.backend.fold_into_child(
                    &self.resolve(layer.path()),
                    &child_path,
                    new_parent.as_deref(),
                    live.as_ref(),
                )?;

                for id in staged.descendants(child) {
                    staged.layer_mut(id)?.level -= 1;
                }
                let merged = staged.layer_mut(child)?;
                merged.parent = layer.parent;
                merged.level = layer.level;
                staged.remove_layer(layer.id)?;
            }
            many => {
                return Err(DeltaError::InvalidState(format!(
                    "snapshot {} backs {} layers",
                    uuid,
                    many.len()
                )));
            }
        }

        if let Err(e) = self.commit(staged) {
            if let Some(device) = live {
                self.poison(format!(
                    "device {} no longer reads {}",
                    device,
                    layer.path().display()
                ));
            }
            return Err(e);
        }

        self.discard_file(layer.path());
        tracing::info!(
            snapshot = %uuid,
            file = %layer.path().display(),
            "Deleted snapshot"
        );
        Ok(())
    }

    /// Point a layer at a different file holding the same content.
    ///
    /// See [`ReplaceParams`] for the caller's obligation.
    pub fn replace(&mut self, params: &ReplaceParams) -> DeltaResult<()> {
        self.ensure_usable()?;

        let id = self.select_layer(&params.selector()?)?;
        let layer = self.state.expect_layer(id)?.clone();
        let old_abs = self.resolve(layer.path());
        let new_abs = self.resolve(&params.file);

        if new_abs == old_abs {
            return Err(DeltaError::InvalidArgument(format!(
                "{} is already the layer's file",
                new_abs.display()
            )));
        }
        if !self.backend.image_exists(&new_abs) {
            return Err(DeltaError::NotFound(format!(
                "replacement image {} does not exist",
                new_abs.display()
            )));
        }
        let new_stored = self.to_stored(&params.file);
        if let Some(other) = self.state.find_by_path(&new_stored) {
            return Err(DeltaError::AlreadyExists(format!(
                "{} is already used by layer {}",
                new_abs.display(),
                other.id()
            )));
        }

        let live = self.live_device_for(id)?;
        if let Some((device, index)) = &live {
            self.backend.swap_layer(device, *index, &new_abs)?;
        }

        if params.keep_name {
            // The descriptor keeps naming the old path; the rename moves the
            // new inode under it and drops the old one.
            if let Err(e) = self.backend.rename_image(&new_abs, &old_abs) {
                self.revert_swap(live.as_ref(), &old_abs);
                return Err(e);
            }
            tracing::info!(
                layer = %layer.id(),
                file = %old_abs.display(),
                "Replaced layer file in place"
            );
            return Ok(());
        }

        let mut staged = self.state.clone();
        staged.layer_mut(id)?.path = new_stored.clone();
        if let Err(e) = self.commit(staged) {
            self.revert_swap(live.as_ref(), &old_abs);
            return Err(e);
        }

        tracing::info!(
            layer = %layer.id(),
            old = %layer.path().display(),
            new = %new_stored.display(),
            "Replaced layer file"
        );
        Ok(())
    }

    fn switch_with(
        &mut self,
        uuid: &SnapshotId,
        policy: SwitchPolicy,
    ) -> DeltaResult<Option<SnapshotId>> {
        self.ensure_usable()?;

        let target = self.find_snapshot(uuid)?.id();
        if let Some(bound) = &self.bound {
            return Err(DeltaError::Busy(format!(
                "cannot switch snapshots while device {} is bound",
                bound.device
            )));
        }

        let mut staged = self.state.clone();
        let old_top = staged.top;
        let mut discarded = Vec::new();

        let kept = if policy.keep_old_top {
            let fresh = SnapshotId::generate();
            let layer = staged.layer_mut(old_top)?;
            layer.top = false;
            layer.uuid = Some(fresh);
            Some(fresh)
        } else {
            staged.layer_mut(old_top)?.top = false;
            discarded = discard_branch(&mut staged, old_top, target)?;
            None
        };

        let (target_path, target_level) = {
            let layer = staged.expect_layer(target)?;
            (self.resolve(layer.path()), layer.level())
        };
        // A later resize only touched the tops above the target.
        let target_size = self.backend.read_image_geometry(&target_path)?.size_sectors;
        staged.geometry.size_sectors = target_size;

        // A target still backing other layers stays read-only; a fresh top
        // goes above it instead.
        let reuse = policy.reuse_target && staged.children(target).is_empty();

        let mut created = None;
        if reuse {
            let layer = staged.layer_mut(target)?;
            layer.uuid = None;
            layer.top = true;
            staged.top = target;
        } else {
            let delta = self.new_delta_path(&staged)?;
            self.backend
                .create_delta(&self.resolve(&delta), &target_path, target_size)?;

            let id = staged.alloc_id();
            staged.layers.push(Layer {
                id,
                path: delta.clone(),
                uuid: None,
                level: target_level + 1,
                parent: Some(target),
                top: true,
            });
            staged.top = id;
            created = Some(delta);
        }

        if let Err(e) = self.commit(staged) {
            if let Some(delta) = created {
                self.discard_file(&delta);
            }
            return Err(e);
        }

        for path in &discarded {
            self.discard_file(path);
        }

        tracing::info!(
            target = %uuid,
            kept = ?kept.map(|k| k.to_string()),
            discarded = discarded.len(),
            reused = reuse,
            size_sectors = target_size,
            "Switched snapshot"
        );
        Ok(kept)
    }

    fn select_layer(&self, selector: &LayerSelector) -> DeltaResult<LayerId> {
        match selector {
            LayerSelector::Uuid(uuid) => self.find_snapshot(uuid).map(Layer::id),
            LayerSelector::File(file) => {
                let wanted = self.resolve(file);
                self.state
                    .layers
                    .iter()
                    .find(|l| self.resolve(l.path()) == wanted)
                    .map(Layer::id)
                    .ok_or_else(|| {
                        DeltaError::NotFound(format!("no layer uses {}", wanted.display()))
                    })
            }
            LayerSelector::Level(level) => self
                .state
                .active_chain()?
                .into_iter()
                .find(|l| l.level() == *level)
                .map(Layer::id)
                .ok_or_else(|| {
                    DeltaError::NotFound(format!("no layer at level {} on the active chain", level))
                }),
        }
    }

    fn revert_swap(&mut self, live: Option<&(DeviceNode, usize)>, old: &Path) {
        if let Some((device, index)) = live
            && let Err(e) = self.backend.swap_layer(device, *index, old)
        {
            self.poison(format!(
                "device {} level {} not restored to {}: {}",
                device,
                index,
                old.display(),
                e
            ));
        }
    }

    /// Fresh delta name next to the base image: `<base>.<uuid>`.
    fn new_delta_path(&self, state: &ChainState) -> DeltaResult<PathBuf> {
        let base = state
            .layers
            .iter()
            .find(|l| l.is_base())
            .ok_or_else(|| DeltaError::Internal("chain has no base layer".to_string()))?;
        let base_name = base
            .path()
            .file_name()
            .ok_or_else(|| {
                DeltaError::Internal(format!(
                    "base layer path {} has no file name",
                    base.path().display()
                ))
            })?
            .to_string_lossy()
            .into_owned();

        for _ in 0..DELTA_NAME_ATTEMPTS {
            let name = format!("{}.{}", base_name, SnapshotId::generate().file_suffix());
            let candidate = base.path().with_file_name(name);
            if state.find_by_path(&candidate).is_none()
                && !self.backend.image_exists(&self.resolve(&candidate))
            {
                return Ok(candidate);
            }
        }
        Err(DeltaError::Internal(
            "could not pick an unused delta file name".to_string(),
        ))
    }
}

/// Remove `from` and its ancestors until reaching a layer the target
/// chain needs or one that still backs another branch. Returns the paths
/// of the removed layers.
fn discard_branch(
    staged: &mut ChainState,
    from: LayerId,
    target: LayerId,
) -> DeltaResult<Vec<PathBuf>> {
    let keep: HashSet<LayerId> = staged.ancestry(target)?.into_iter().collect();
    let mut removed = Vec::new();
    let mut cursor = Some(from);

    while let Some(id) = cursor {
        if keep.contains(&id) || !staged.children(id).is_empty() {
            break;
        }
        let layer = staged.remove_layer(id)?;
        cursor = layer.parent;
        removed.push(layer.path);
    }
    Ok(removed)
}
