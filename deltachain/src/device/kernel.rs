//! Process-wide kernel support initialization.
//!
//! Each backend's `ensure_kernel_support` runs at most once successfully
//! per process. A failure is returned to the caller and the next call
//! tries again.

use std::collections::HashSet;
use std::sync::LazyLock;

use deltachain_shared::errors::DeltaResult;
use parking_lot::Mutex;

use crate::backend::ImageBackend;

static LOADED: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Load kernel support for `backend` unless already done in this process.
pub fn ensure_loaded(backend: &dyn ImageBackend) -> DeltaResult<()> {
    // Held across the load so concurrent first callers wait for one attempt.
    let mut loaded = LOADED.lock();
    if loaded.contains(backend.name()) {
        return Ok(());
    }

    match backend.ensure_kernel_support() {
        Ok(()) => {
            tracing::info!(backend = backend.name(), "Kernel support loaded");
            loaded.insert(backend.name().to_string());
            Ok(())
        }
        Err(e) => {
            tracing::warn!(backend = backend.name(), error = %e, "Kernel support load failed");
            Err(e)
        }
    }
}

/// Whether `ensure_loaded` already succeeded for a backend name.
pub fn is_loaded(name: &str) -> bool {
    LOADED.lock().contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::backend::memory::FailPoint;

    #[test]
    fn test_runs_once() {
        let backend = MemoryBackend::new();
        ensure_loaded(&backend).unwrap();
        ensure_loaded(&backend).unwrap();
        assert_eq!(backend.kernel_loads(), 1);
        assert!(is_loaded(backend.name()));
    }

    #[test]
    fn test_failure_is_retried() {
        let backend = MemoryBackend::new();
        backend.fail_once(FailPoint::KernelSupport);

        assert!(ensure_loaded(&backend).is_err());
        assert!(!is_loaded(backend.name()));

        ensure_loaded(&backend).unwrap();
        assert_eq!(backend.kernel_loads(), 2);
        assert!(is_loaded(backend.name()));
    }
}
