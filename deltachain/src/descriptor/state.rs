//! Persisted chain state.
//!
//! `ChainState` is the serialized body of `DiskDescriptor.json`: image
//! geometry plus every layer the image directory owns. Layers form a tree
//! rooted at the single base; the active chain is the ancestry of the top
//! layer. Any state read from disk goes through [`ChainState::validate`]
//! before it is trusted.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use deltachain_shared::errors::{DeltaError, DeltaResult};
use serde::{Deserialize, Serialize};

use crate::constants::descriptor::SCHEMA_VERSION;
use crate::snapshot_id::SnapshotId;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// On-disk allocation mode of the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMode {
    /// Sparse image, blocks allocated on first write.
    Expanded,
    /// Sparse format with every block allocated up front.
    Preallocated,
    /// Plain raw image.
    Raw,
}

impl ImageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMode::Expanded => "expanded",
            ImageMode::Preallocated => "preallocated",
            ImageMode::Raw => "raw",
        }
    }
}

impl Default for ImageMode {
    fn default() -> Self {
        ImageMode::Expanded
    }
}

impl FromStr for ImageMode {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expanded" => Ok(ImageMode::Expanded),
            "preallocated" => Ok(ImageMode::Preallocated),
            "raw" => Ok(ImageMode::Raw),
            _ => Err(DeltaError::InvalidArgument(format!(
                "Unknown image mode: '{}'. Supported: expanded, preallocated, raw",
                s
            ))),
        }
    }
}

impl fmt::Display for ImageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal layer key. Stable across renames and replaces, never shown
/// to callers as a snapshot name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(u64);

impl LayerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Image geometry recorded in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Logical device size in 512-byte sectors.
    pub size_sectors: u64,
    /// Allocation block (cluster) size in sectors.
    pub block_size_sectors: u32,
    pub format_version: u32,
    pub mode: ImageMode,
}

/// Role of a layer in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// The single writable layer.
    Top,
    /// Named, read-only.
    Snapshot,
    /// Unnamed, read-only, not top.
    Intermediate,
}

/// One delta file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub(crate) id: LayerId,
    /// Relative paths resolve against the descriptor directory.
    pub(crate) path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) uuid: Option<SnapshotId>,
    pub(crate) level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent: Option<LayerId>,
    #[serde(default)]
    pub(crate) top: bool,
}

impl Layer {
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Path as recorded in the descriptor.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uuid(&self) -> Option<SnapshotId> {
        self.uuid
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn is_top(&self) -> bool {
        self.top
    }

    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }

    pub fn state(&self) -> LayerState {
        match (self.top, self.uuid) {
            (true, _) => LayerState::Top,
            (false, Some(_)) => LayerState::Snapshot,
            (false, None) => LayerState::Intermediate,
        }
    }
}

/// Serialized descriptor body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub(crate) version: u32,
    pub(crate) geometry: Geometry,
    /// Oldest first: ordered by level, then by creation.
    pub(crate) layers: Vec<Layer>,
    pub(crate) top: LayerId,
    pub(crate) next_id: u64,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ChainState {
    /// Single-layer chain: the base is the top.
    pub(crate) fn new(base_path: PathBuf, geometry: Geometry) -> Self {
        let base = Layer {
            id: LayerId(0),
            path: base_path,
            uuid: None,
            level: 0,
            parent: None,
            top: true,
        };

        Self {
            version: SCHEMA_VERSION,
            geometry,
            layers: vec![base],
            top: LayerId(0),
            next_id: 1,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> DeltaResult<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| DeltaError::Internal(format!("layer {} vanished from chain", id)))
    }

    pub(crate) fn expect_layer(&self, id: LayerId) -> DeltaResult<&Layer> {
        self.layer(id)
            .ok_or_else(|| DeltaError::Internal(format!("layer {} vanished from chain", id)))
    }

    pub fn top_layer(&self) -> DeltaResult<&Layer> {
        self.expect_layer(self.top)
    }

    pub fn find_by_uuid(&self, uuid: &SnapshotId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.uuid.as_ref() == Some(uuid))
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&Layer> {
        self.layers.iter().find(|l| l.path == path)
    }

    pub fn children(&self, id: LayerId) -> Vec<LayerId> {
        self.layers
            .iter()
            .filter(|l| l.parent == Some(id))
            .map(|l| l.id)
            .collect()
    }

    /// Every layer below `id` in the tree (children, grandchildren, ...).
    pub(crate) fn descendants(&self, id: LayerId) -> Vec<LayerId> {
        let mut out = Vec::new();
        let mut pending = self.children(id);
        while let Some(next) = pending.pop() {
            pending.extend(self.children(next));
            out.push(next);
        }
        out
    }

    /// Layer ids from the base up to and including `id`.
    pub fn ancestry(&self, id: LayerId) -> DeltaResult<Vec<LayerId>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if chain.len() > self.layers.len() {
                return Err(DeltaError::Internal(format!(
                    "parent links of layer {} form a cycle",
                    id
                )));
            }
            let layer = self.expect_layer(current)?;
            chain.push(current);
            cursor = layer.parent;
        }

        chain.reverse();
        Ok(chain)
    }

    /// The active chain, base first, top last.
    pub fn active_chain(&self) -> DeltaResult<Vec<&Layer>> {
        self.ancestry(self.top)?
            .into_iter()
            .map(|id| self.expect_layer(id))
            .collect()
    }

    pub(crate) fn remove_layer(&mut self, id: LayerId) -> DeltaResult<Layer> {
        let index = self
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| DeltaError::Internal(format!("layer {} vanished from chain", id)))?;
        Ok(self.layers.remove(index))
    }

    /// Restore the oldest-first ordering after a mutation.
    pub(crate) fn normalize(&mut self) {
        self.layers.sort_by_key(|l| (l.level, l.id));
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> DeltaResult<()> {
        let corrupt = |msg: String| Err(DeltaError::CorruptData(msg));

        if self.version > SCHEMA_VERSION {
            return corrupt(format!(
                "descriptor version {} is newer than supported version {}",
                self.version, SCHEMA_VERSION
            ));
        }
        if self.layers.is_empty() {
            return corrupt("descriptor has no layers".to_string());
        }
        if self.geometry.size_sectors == 0 || self.geometry.block_size_sectors == 0 {
            return corrupt("geometry has zero size or block size".to_string());
        }

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        let mut uuids = HashSet::new();
        for layer in &self.layers {
            if !ids.insert(layer.id) {
                return corrupt(format!("duplicate layer id {}", layer.id));
            }
            if !paths.insert(layer.path.as_path()) {
                return corrupt(format!("duplicate layer path {}", layer.path.display()));
            }
            if let Some(uuid) = &layer.uuid
                && !uuids.insert(*uuid)
            {
                return corrupt(format!("duplicate snapshot uuid {}", uuid));
            }
            if layer.id.0 >= self.next_id {
                return corrupt(format!("layer id {} not below id allocator", layer.id));
            }
        }

        let tops: Vec<&Layer> = self.layers.iter().filter(|l| l.top).collect();
        match tops.as_slice() {
            [only] if only.id == self.top => {
                if only.uuid.is_some() {
                    return corrupt(format!("top layer {} carries a snapshot uuid", only.id));
                }
            }
            [only] => {
                return corrupt(format!(
                    "top pointer {} does not match top-marked layer {}",
                    self.top, only.id
                ));
            }
            [] => {
                return corrupt(format!("top pointer {} references no top layer", self.top));
            }
            _ => return corrupt(format!("{} layers are marked top", tops.len())),
        }

        let bases = self.layers.iter().filter(|l| l.level == 0).count();
        if bases != 1 {
            return corrupt(format!("{} layers claim level 0", bases));
        }

        for layer in &self.layers {
            match (layer.level, layer.parent) {
                (0, None) => {}
                (0, Some(_)) => {
                    return corrupt(format!("base layer {} has a parent", layer.id));
                }
                (_, None) => {
                    return corrupt(format!(
                        "layer {} at level {} has no parent",
                        layer.id, layer.level
                    ));
                }
                (level, Some(parent_id)) => {
                    let Some(parent) = self.layer(parent_id) else {
                        return corrupt(format!(
                            "layer {} references missing parent {}",
                            layer.id, parent_id
                        ));
                    };
                    if parent.level + 1 != level {
                        return corrupt(format!(
                            "layer {} at level {} has parent {} at level {}",
                            layer.id, level, parent.id, parent.level
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Load and validate a descriptor file.
    pub fn load(path: &Path) -> DeltaResult<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeltaError::NotFound(format!(
                    "descriptor {} does not exist",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(DeltaError::io(
                    format!("failed to read descriptor {}", path.display()),
                    e,
                ));
            }
        };

        let state: Self = serde_json::from_str(&contents).map_err(|e| {
            DeltaError::CorruptData(format!("failed to parse {}: {}", path.display(), e))
        })?;
        state.validate()?;

        tracing::debug!(
            descriptor = %path.display(),
            layers = state.layers.len(),
            "Loaded descriptor"
        );
        Ok(state)
    }

    /// Atomically replace the descriptor file with this state.
    ///
    /// Writes a temp file in the same directory, syncs it, renames it over
    /// the descriptor and syncs the directory.
    pub(crate) fn save(&self, path: &Path) -> DeltaResult<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| DeltaError::Internal(format!("failed to serialize descriptor: {e}")))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".descriptor-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                DeltaError::io(format!("failed to create temp file in {}", dir.display()), e)
            })?;

        tmp.write_all(&json)
            .map_err(|e| DeltaError::io("failed to write descriptor", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| DeltaError::io("failed to sync descriptor", e))?;

        tmp.persist(path).map_err(|e| {
            DeltaError::io(
                format!("failed to install descriptor {}", path.display()),
                e.error,
            )
        })?;

        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        tracing::debug!(descriptor = %path.display(), "Persisted descriptor");
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn geometry() -> Geometry {
        Geometry {
            size_sectors: 786432,
            block_size_sectors: 2048,
            format_version: 2,
            mode: ImageMode::Expanded,
        }
    }

    fn two_layer_state() -> ChainState {
        let mut state = ChainState::new(PathBuf::from("root.hdd"), geometry());
        let child = state.alloc_id();
        state.layers[0].top = false;
        state.layers[0].uuid = Some(SnapshotId::generate());
        state.layers.push(Layer {
            id: child,
            path: PathBuf::from("root.hdd.child"),
            uuid: None,
            level: 1,
            parent: Some(LayerId(0)),
            top: true,
        });
        state.top = child;
        state
    }

    #[test]
    fn test_new_state_is_valid() {
        let state = ChainState::new(PathBuf::from("root.hdd"), geometry());
        state.validate().unwrap();
        assert_eq!(state.layers().len(), 1);
        assert_eq!(state.top_layer().unwrap().state(), LayerState::Top);
    }

    #[test]
    fn test_image_mode_parse() {
        assert_eq!("Expanded".parse::<ImageMode>().unwrap(), ImageMode::Expanded);
        assert_eq!("raw".parse::<ImageMode>().unwrap(), ImageMode::Raw);
        assert!(matches!(
            "ploop".parse::<ImageMode>(),
            Err(DeltaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ancestry_and_children() {
        let state = two_layer_state();
        let chain = state.active_chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].is_base());
        assert!(chain[1].is_top());
        assert_eq!(state.children(LayerId(0)), vec![LayerId(1)]);
        assert_eq!(state.descendants(LayerId(0)), vec![LayerId(1)]);
    }

    #[test]
    fn test_validate_rejects_two_bases() {
        let mut state = two_layer_state();
        state.layers[1].level = 0;
        state.layers[1].parent = None;
        assert!(matches!(state.validate(), Err(DeltaError::CorruptData(_))));
    }

    #[test]
    fn test_validate_rejects_dangling_top() {
        let mut state = two_layer_state();
        state.top = LayerId(7);
        state.next_id = 8;
        assert!(matches!(state.validate(), Err(DeltaError::CorruptData(_))));
    }

    #[test]
    fn test_validate_rejects_named_top() {
        let mut state = two_layer_state();
        state.layers[1].uuid = Some(SnapshotId::generate());
        assert!(matches!(state.validate(), Err(DeltaError::CorruptData(_))));
    }

    #[test]
    fn test_validate_rejects_level_gap() {
        let mut state = two_layer_state();
        state.layers[1].level = 2;
        assert!(matches!(state.validate(), Err(DeltaError::CorruptData(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_uuid() {
        let mut state = two_layer_state();
        let uuid = state.layers[0].uuid;
        let id = state.alloc_id();
        state.layers.push(Layer {
            id,
            path: PathBuf::from("branch"),
            uuid,
            level: 1,
            parent: Some(LayerId(0)),
            top: false,
        });
        assert!(matches!(state.validate(), Err(DeltaError::CorruptData(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("DiskDescriptor.json");
        let state = two_layer_state();

        state.save(&path).unwrap();
        let loaded = ChainState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = ChainState::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, DeltaError::NotFound(_)));
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("DiskDescriptor.json");
        std::fs::write(&path, "<Parallels_disk_image/>").unwrap();
        let err = ChainState::load(&path).unwrap_err();
        assert!(matches!(err, DeltaError::CorruptData(_)));
    }
}
