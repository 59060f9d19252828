//! Chain mutator parameters.

use std::path::PathBuf;

use deltachain_shared::errors::{DeltaError, DeltaResult};

use crate::snapshot_id::SnapshotId;

/// How `switch_snapshot_ext` treats the old top and the target.
///
/// Every combination is accepted. `reuse_target` is a preference: a
/// target that still backs other layers after the old top is handled
/// keeps its name and gets an empty top above it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchPolicy {
    /// Keep the old top as a named snapshot instead of discarding it.
    pub keep_old_top: bool,
    /// Make the target itself the writable top instead of creating an
    /// empty layer above it. A promoted target loses its name.
    pub reuse_target: bool,
}

impl SwitchPolicy {
    pub fn keep_old_top(mut self) -> Self {
        self.keep_old_top = true;
        self
    }

    pub fn reuse_target(mut self) -> Self {
        self.reuse_target = true;
        self
    }
}

/// Which layer a [`ReplaceParams`] addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelector {
    Uuid(SnapshotId),
    File(PathBuf),
    /// Level on the active chain.
    Level(u32),
}

/// Parameters for `replace`.
///
/// The caller guarantees that `file` holds exactly the logical content of
/// the layer it replaces. Nothing checks this; replacing a layer with
/// different content corrupts every layer above it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceParams {
    /// New image file. Relative paths resolve against the image directory.
    pub file: PathBuf,
    pub uuid: Option<SnapshotId>,
    /// Current file of the layer to replace.
    pub cur_file: Option<PathBuf>,
    pub level: Option<u32>,
    /// Rename the new file over the old one so the layer keeps its path.
    pub keep_name: bool,
}

impl ReplaceParams {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    /// Selector by precedence: uuid, then current file, then level.
    pub fn selector(&self) -> DeltaResult<LayerSelector> {
        if let Some(uuid) = self.uuid {
            return Ok(LayerSelector::Uuid(uuid));
        }
        if let Some(cur) = &self.cur_file {
            return Ok(LayerSelector::File(cur.clone()));
        }
        if let Some(level) = self.level {
            return Ok(LayerSelector::Level(level));
        }
        Err(DeltaError::InvalidArgument(
            "replace needs a uuid, current file or level".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_precedence() {
        let uuid = SnapshotId::generate();
        let params = ReplaceParams {
            uuid: Some(uuid),
            cur_file: Some(PathBuf::from("root.hdd")),
            level: Some(0),
            ..ReplaceParams::new("new.hdd")
        };
        assert_eq!(params.selector().unwrap(), LayerSelector::Uuid(uuid));

        let params = ReplaceParams {
            cur_file: Some(PathBuf::from("root.hdd")),
            level: Some(0),
            ..ReplaceParams::new("new.hdd")
        };
        assert_eq!(
            params.selector().unwrap(),
            LayerSelector::File(PathBuf::from("root.hdd"))
        );

        let params = ReplaceParams {
            level: Some(3),
            ..ReplaceParams::new("new.hdd")
        };
        assert_eq!(params.selector().unwrap(), LayerSelector::Level(3));
    }

    #[test]
    fn test_selector_missing() {
        let err = ReplaceParams::new("new.hdd").selector().unwrap_err();
        assert!(matches!(err, DeltaError::InvalidArgument(_)));
    }

    #[test]
    fn test_policy_builders() {
        let policy = SwitchPolicy::default().keep_old_top().reuse_target();
        assert!(policy.keep_old_top);
        assert!(policy.reuse_target);
        assert_eq!(SwitchPolicy::default(), SwitchPolicy { keep_old_top: false, reuse_target: false });
    }
}
