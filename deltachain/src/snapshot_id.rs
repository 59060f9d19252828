//! Snapshot identifiers.
//!
//! Snapshots are named by random (v4) UUIDs. The textual form is the
//! braced one used by the on-disk descriptors of the original engine
//! (`{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}`); parsing accepts the
//! braced and the bare hyphenated forms.

use std::fmt;
use std::str::FromStr;

use deltachain_shared::errors::DeltaError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// UUID naming a snapshot layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Hyphenated form without braces, used in delta file names.
    pub fn file_suffix(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

/// Generate a snapshot UUID.
pub fn generate_uuid() -> SnapshotId {
    SnapshotId::generate()
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.hyphenated())
    }
}

impl FromStr for SnapshotId {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);

        Uuid::parse_str(inner)
            .map(SnapshotId)
            .map_err(|e| DeltaError::InvalidArgument(format!("invalid snapshot uuid '{}': {}", s, e)))
    }
}

impl From<Uuid> for SnapshotId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Serialize for SnapshotId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnapshotId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_uuid();
        let b = generate_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_is_braced() {
        let id = generate_uuid();
        let text = id.to_string();
        // 36 hyphenated chars + 2 braces
        assert_eq!(text.len(), 38);
        assert!(text.starts_with('{'));
        assert!(text.ends_with('}'));
    }

    #[test]
    fn test_parse_braced_and_bare() {
        let id = generate_uuid();
        let braced: SnapshotId = id.to_string().parse().unwrap();
        let bare: SnapshotId = id.file_suffix().parse().unwrap();
        assert_eq!(braced, id);
        assert_eq!(bare, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<SnapshotId>().unwrap_err();
        assert!(matches!(err, DeltaError::InvalidArgument(_)));
    }

    #[test]
    fn test_serde_uses_braced_string() {
        let id = generate_uuid();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: SnapshotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
