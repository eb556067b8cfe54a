//! Scoped release of a merge's write locks

use coherence_core::MergeToken;
use std::sync::Arc;

use crate::write_lock::WriteLockCoordinator;

/// Owns one merge's token; releases every lock it acquired on drop
///
/// Dropping the guard on an error path (or during unwinding) releases the
/// locks just as a normal completion does.
#[derive(Debug)]
pub struct MergeLockGuard {
    coordinator: Arc<WriteLockCoordinator>,
    token: MergeToken,
}

impl MergeLockGuard {
    pub(crate) fn new(coordinator: Arc<WriteLockCoordinator>, token: MergeToken) -> Self {
        Self { coordinator, token }
    }

    /// Token owning the merge's locks
    pub fn token(&self) -> MergeToken {
        self.token
    }

    /// Coordinator the locks were acquired through
    pub fn coordinator(&self) -> &Arc<WriteLockCoordinator> {
        &self.coordinator
    }
}

impl Drop for MergeLockGuard {
    fn drop(&mut self) {
        self.coordinator.release_all(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_cache::IdentityMap;
    use coherence_core::{CacheKey, PrimaryKey};

    #[test]
    fn test_drop_releases_locks() {
        let cache = Arc::new(IdentityMap::new());
        let coord = Arc::new(WriteLockCoordinator::new(Arc::clone(&cache)));
        let key = CacheKey::new("Employee", PrimaryKey::int(1));
        {
            let guard = coord.begin();
            coord.acquire(guard.token(), &key).unwrap();
            assert_eq!(cache.len(), 1);
        }
        assert_eq!(coord.active_merges(), 0);
        // The vacant entry created for the lock is dropped on release.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_drop_during_unwind_releases_locks() {
        let cache = Arc::new(IdentityMap::new());
        let coord = Arc::new(WriteLockCoordinator::new(Arc::clone(&cache)));
        let key = CacheKey::new("Employee", PrimaryKey::int(1));

        let c = Arc::clone(&coord);
        let k = key.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let guard = c.begin();
            c.acquire(guard.token(), &k).unwrap();
            panic!("mapping failed");
        }));
        assert!(result.is_err());
        assert_eq!(coord.active_merges(), 0);
        assert!(cache.lookup_entry(&key).is_none());
    }
}
