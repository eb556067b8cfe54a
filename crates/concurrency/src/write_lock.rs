//! Write-lock coordination for merges
//!
//! The coordinator tracks, per [`MergeToken`], which cache entries a merge
//! holds and which key it is currently blocked on. It decides what happens
//! when a merge meets a held entry:
//!
//! 1. Try a no-wait acquire
//! 2. If that fails and the merge already holds other entries, switch the
//!    merge to deferred-lock mode and report the key as deferred: the
//!    caller finishes the non-conflicting part of the graph first and
//!    revisits deferred keys after releasing what it holds
//! 3. Otherwise record the key as queued and block until the entry is free
//!    (bounded by the configured wait timeout)
//!
//! Blocking only while holding nothing means two merges cannot deadlock
//! on each other's entries through this path. The transition to deferred
//! mode is one-way for the life of the merge.
//!
//! ## Ownership
//!
//! Locks belong to the token, so `release_all` may run on any thread.
//! [`MergeLockGuard`](crate::guard::MergeLockGuard) calls it from `Drop`.

use coherence_cache::{AcquireMode, CacheEntry, IdentityMap};
use coherence_core::{CacheKey, CoherenceError, CoherenceResult, MergeToken};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::guard::MergeLockGuard;

/// Result of asking for an entry's write lock
#[derive(Debug, Clone)]
pub enum LockOutcome {
    /// The merge now holds the entry
    Acquired(Arc<CacheEntry>),
    /// The entry is held elsewhere and the merge is in deferred-lock mode
    Deferred(CacheKey),
}

#[derive(Debug, Default)]
struct MergeLockState {
    held: Vec<Arc<CacheEntry>>,
    queued: Option<CacheKey>,
    deferred: bool,
}

/// Serializes concurrent merges' access to cache entries
pub struct WriteLockCoordinator {
    cache: Arc<IdentityMap>,
    merges: DashMap<MergeToken, MergeLockState>,
    deferred_enabled: bool,
    wait_timeout: Option<Duration>,
    deferred_transitions: AtomicU64,
}

impl WriteLockCoordinator {
    /// Coordinator with deferred locking enabled and unbounded waits
    pub fn new(cache: Arc<IdentityMap>) -> Self {
        Self::with_options(cache, true, None)
    }

    /// Coordinator with explicit options
    ///
    /// # Arguments
    ///
    /// * `cache` - Identity map whose entries are locked
    /// * `deferred_enabled` - Allow the transition to deferred-lock mode;
    ///   when `false`, contention always blocks
    /// * `wait_timeout` - Bound on blocking acquires, `None` for unbounded
    pub fn with_options(
        cache: Arc<IdentityMap>,
        deferred_enabled: bool,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            merges: DashMap::new(),
            deferred_enabled,
            wait_timeout,
            deferred_transitions: AtomicU64::new(0),
        }
    }

    /// The identity map being coordinated
    pub fn cache(&self) -> &Arc<IdentityMap> {
        &self.cache
    }

    /// Start tracking a new merge
    ///
    /// The returned guard releases everything the merge acquires when it
    /// is dropped.
    pub fn begin(self: &Arc<Self>) -> MergeLockGuard {
        let token = MergeToken::next();
        self.merges.insert(token, MergeLockState::default());
        debug!(target: "coherence::lock", token = %token, "merge started");
        MergeLockGuard::new(Arc::clone(self), token)
    }

    fn already_held(&self, token: MergeToken, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.merges.get(&token).and_then(|state| {
            state
                .held
                .iter()
                .find(|e| e.key() == key)
                .map(Arc::clone)
        })
    }

    fn record_held(&self, token: MergeToken, entry: &Arc<CacheEntry>) {
        self.merges
            .entry(token)
            .or_default()
            .held
            .push(Arc::clone(entry));
    }

    /// Acquire `key` for `token`, deferring instead of blocking when the
    /// merge already holds other entries
    ///
    /// # Errors
    ///
    /// `LockTimeout` if a blocking wait exceeds the configured timeout.
    pub fn acquire(&self, token: MergeToken, key: &CacheKey) -> CoherenceResult<LockOutcome> {
        if let Some(entry) = self.already_held(token, key) {
            return Ok(LockOutcome::Acquired(entry));
        }

        if let Ok(entry) = self.cache.acquire_for_write(key, token, AcquireMode::NoWait) {
            self.record_held(token, &entry);
            return Ok(LockOutcome::Acquired(entry));
        }

        if self.deferred_enabled {
            let mut state = self.merges.entry(token).or_default();
            if state.deferred || !state.held.is_empty() {
                if !state.deferred {
                    state.deferred = true;
                    self.deferred_transitions.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "coherence::lock",
                        token = %token,
                        key = %key,
                        held = state.held.len(),
                        "lock contention, switching merge to deferred locks"
                    );
                }
                return Ok(LockOutcome::Deferred(key.clone()));
            }
        }

        self.acquire_blocking(token, key).map(LockOutcome::Acquired)
    }

    /// Acquire `key` for `token`, blocking while it is held elsewhere
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the wait exceeds the configured timeout.
    pub fn acquire_blocking(
        &self,
        token: MergeToken,
        key: &CacheKey,
    ) -> CoherenceResult<Arc<CacheEntry>> {
        if let Some(entry) = self.already_held(token, key) {
            return Ok(entry);
        }
        self.merges.entry(token).or_default().queued = Some(key.clone());
        debug!(target: "coherence::lock", token = %token, key = %key, "waiting for write lock");

        let result = self
            .cache
            .acquire_for_write(key, token, AcquireMode::Wait(self.wait_timeout));

        if let Some(mut state) = self.merges.get_mut(&token) {
            state.queued = None;
        }
        let entry = result.map_err(CoherenceError::from)?;
        self.record_held(token, &entry);
        Ok(entry)
    }

    /// Acquire every key in ascending key order, blocking as needed
    ///
    /// Merges that lock their whole working set this way cannot deadlock
    /// with each other. Duplicate keys are acquired once.
    ///
    /// # Errors
    ///
    /// `LockTimeout` on the first key whose wait exceeds the timeout.
    /// Entries acquired before the failure stay held by the merge.
    pub fn acquire_ordered(
        &self,
        token: MergeToken,
        keys: &[CacheKey],
    ) -> CoherenceResult<Vec<Arc<CacheEntry>>> {
        let mut sorted: Vec<&CacheKey> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        sorted
            .into_iter()
            .map(|key| self.acquire_blocking(token, key))
            .collect()
    }

    /// Entry `token` holds for `key`, if any
    pub fn held_entry(&self, token: MergeToken, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.already_held(token, key)
    }

    /// Release every entry `token` holds but keep tracking the merge
    ///
    /// Used before revisiting deferred keys one at a time.
    pub fn release_held(&self, token: MergeToken) -> usize {
        let held = match self.merges.get_mut(&token) {
            Some(mut state) => std::mem::take(&mut state.held),
            None => return 0,
        };
        self.release_entries(token, held)
    }

    /// Release the single entry `token` holds for `key`
    pub fn release_one(&self, token: MergeToken, key: &CacheKey) -> bool {
        let entry = match self.merges.get_mut(&token) {
            Some(mut state) => match state.held.iter().position(|e| e.key() == key) {
                Some(pos) => state.held.swap_remove(pos),
                None => return false,
            },
            None => return false,
        };
        self.cache.release(&entry, token)
    }

    /// Release every entry `token` holds and stop tracking the merge
    ///
    /// Safe to call more than once and from any thread.
    pub fn release_all(&self, token: MergeToken) -> usize {
        match self.merges.remove(&token) {
            Some((_, state)) => self.release_entries(token, state.held),
            None => 0,
        }
    }

    fn release_entries(&self, token: MergeToken, held: Vec<Arc<CacheEntry>>) -> usize {
        let released = held
            .iter()
            .filter(|entry| self.cache.release(entry, token))
            .count();
        if released > 0 {
            debug!(target: "coherence::lock", token = %token, released, "released write locks");
        }
        released
    }

    /// Key `token` is currently blocked on
    pub fn queued_on(&self, token: MergeToken) -> Option<CacheKey> {
        self.merges.get(&token).and_then(|s| s.queued.clone())
    }

    /// Check if the merge switched to deferred-lock mode
    pub fn is_transitioned_to_deferred_locks(&self, token: MergeToken) -> bool {
        self.merges.get(&token).map(|s| s.deferred).unwrap_or(false)
    }

    /// Number of entries `token` holds
    pub fn held_count(&self, token: MergeToken) -> usize {
        self.merges.get(&token).map(|s| s.held.len()).unwrap_or(0)
    }

    /// Number of merges being tracked
    pub fn active_merges(&self) -> usize {
        self.merges.len()
    }

    /// Total transitions to deferred-lock mode
    pub fn deferred_transitions(&self) -> u64 {
        self.deferred_transitions.load(Ordering::Relaxed)
    }

    /// Check if the deferred-lock transition is enabled
    pub fn deferred_enabled(&self) -> bool {
        self.deferred_enabled
    }
}

impl std::fmt::Debug for WriteLockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLockCoordinator")
            .field("active_merges", &self.merges.len())
            .field("deferred_enabled", &self.deferred_enabled)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::PrimaryKey;

    fn key(id: i64) -> CacheKey {
        CacheKey::new("Employee", PrimaryKey::int(id))
    }

    fn coordinator() -> Arc<WriteLockCoordinator> {
        Arc::new(WriteLockCoordinator::new(Arc::new(IdentityMap::new())))
    }

    #[test]
    fn test_acquire_free_entry() {
        let coord = coordinator();
        let guard = coord.begin();
        let outcome = coord.acquire(guard.token(), &key(1)).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(coord.held_count(guard.token()), 1);
    }

    #[test]
    fn test_reacquire_returns_held_entry() {
        let coord = coordinator();
        let guard = coord.begin();
        coord.acquire(guard.token(), &key(1)).unwrap();
        coord.acquire(guard.token(), &key(1)).unwrap();
        assert_eq!(coord.held_count(guard.token()), 1);
    }

    #[test]
    fn test_contention_while_holding_defers() {
        let coord = coordinator();
        let a = coord.begin();
        let b = coord.begin();
        coord.acquire(a.token(), &key(2)).unwrap();
        coord.acquire(b.token(), &key(1)).unwrap();

        let outcome = coord.acquire(b.token(), &key(2)).unwrap();
        assert!(matches!(outcome, LockOutcome::Deferred(ref k) if *k == key(2)));
        assert!(coord.is_transitioned_to_deferred_locks(b.token()));
        assert!(!coord.is_transitioned_to_deferred_locks(a.token()));
        assert_eq!(coord.deferred_transitions(), 1);
    }

    #[test]
    fn test_contention_without_holding_blocks_until_timeout() {
        let cache = Arc::new(IdentityMap::new());
        let coord = Arc::new(WriteLockCoordinator::with_options(
            cache,
            true,
            Some(Duration::from_millis(20)),
        ));
        let a = coord.begin();
        let b = coord.begin();
        coord.acquire(a.token(), &key(1)).unwrap();
        let err = coord.acquire(b.token(), &key(1)).unwrap_err();
        assert!(matches!(err, CoherenceError::LockTimeout { .. }));
        assert_eq!(coord.queued_on(b.token()), None);
        assert!(!coord.is_transitioned_to_deferred_locks(b.token()));
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let coord = coordinator();
        let guard = coord.begin();
        let token = guard.token();
        coord.acquire(token, &key(1)).unwrap();
        coord.acquire(token, &key(2)).unwrap();
        assert_eq!(coord.release_all(token), 2);
        assert_eq!(coord.release_all(token), 0);
        assert_eq!(coord.active_merges(), 0);
    }

    #[test]
    fn test_acquire_ordered_dedups() {
        let coord = coordinator();
        let guard = coord.begin();
        let entries = coord
            .acquire_ordered(guard.token(), &[key(3), key(1), key(3), key(2)])
            .unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key().clone()).collect();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);
    }

    #[test]
    fn test_release_one() {
        let coord = coordinator();
        let guard = coord.begin();
        coord.acquire(guard.token(), &key(1)).unwrap();
        assert!(coord.release_one(guard.token(), &key(1)));
        assert!(!coord.release_one(guard.token(), &key(1)));
        assert_eq!(coord.held_count(guard.token()), 0);
    }
}
