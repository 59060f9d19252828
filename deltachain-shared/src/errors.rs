//! Error taxonomy for delta-chain operations.
//!
//! Variants are kinds, not transport types: callers match on the variant
//! to decide remediation, and the payload carries the human-readable
//! detail. Lower-layer I/O failures keep their `io::Error` as the source.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type DeltaResult<T> = Result<T, DeltaError>;

#[derive(Debug, Error)]
pub enum DeltaError {
    /// Malformed caller input (zero size, unknown mode, bad selector).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced path, UUID or layer is absent.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Conflicting bind/mount/resize state, or a held store lock.
    #[error("busy: {0}")]
    Busy(String),

    /// Operation needs a bound device and there is none.
    #[error("no device bound: {0}")]
    NotBound(String),

    /// Operation needs a mounted filesystem and there is none.
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// Operation is not valid in the current descriptor state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Persisted descriptor fails to parse or violates chain invariants.
    #[error("corrupt descriptor: {0}")]
    CorruptData(String),

    /// Shrinking would cut into blocks the filesystem still uses.
    #[error(
        "resize would truncate data: filesystem needs {required_kb} KB, requested {requested_kb} KB"
    )]
    WouldTruncateData { required_kb: u64, requested_kb: u64 },

    /// Lower-layer I/O failure with the original cause attached.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Lower-layer failure reported by a helper tool or engine.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    /// Invariant violation inside the chain mutator. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeltaError {
    /// Wrap an `io::Error` with a description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        DeltaError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors caused by caller input rather than system state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DeltaError::InvalidArgument(_) | DeltaError::NotFound(_) | DeltaError::AlreadyExists(_)
        )
    }
}
