//! Process-wide identity map
//!
//! Maps each [`CacheKey`] to exactly one [`CacheEntry`]. Entries live in a
//! `DashMap` so that lookups on different keys never contend, and each
//! entry carries its own write permit so that writers on different keys
//! proceed in parallel.
//!
//! # Design
//!
//! - `lookup` never touches a write permit
//! - `acquire_for_write` creates a vacant entry when the key is absent,
//!   so a merge inserting a new object is serialized with any other merge
//!   inserting the same key
//! - Entry state changes (`install`, `record_write`, `remove`) require the
//!   caller's token to hold the entry's permit
//! - No shard guard is held while blocking on a permit

use coherence_core::{
    CacheKey, CoherenceError, CoherenceResult, EntityObject, EntityType, MergeToken, ObjectId,
    ObjectSpace, Timestamp, WriteLockValue,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::invalidation::{CacheInvalidationPolicy, ExpiryIndex};

/// How long `acquire_for_write` may wait for a held permit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail immediately if another merge holds the permit
    NoWait,
    /// Wait, optionally bounded
    Wait(Option<Duration>),
}

/// Failure to acquire a write permit
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Held by another merge and the caller would not wait
    #[error("write lock on {key} unavailable")]
    Unavailable {
        /// Contended key
        key: CacheKey,
    },
    /// Held by another merge for longer than the caller would wait
    #[error("timed out after {waited:?} on {key}")]
    TimedOut {
        /// Contended key
        key: CacheKey,
        /// Time waited
        waited: Duration,
    },
}

impl From<AcquireError> for CoherenceError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Unavailable { key } => CoherenceError::LockUnavailable { key },
            AcquireError::TimedOut { key, waited } => CoherenceError::LockTimeout {
                key,
                waited_ms: waited.as_millis() as u64,
            },
        }
    }
}

/// Lock and invalidation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityMapStats {
    /// Number of entries
    pub entries: usize,
    /// Successful permit acquisitions
    pub acquisitions: u64,
    /// Acquisitions that found the permit held
    pub contentions: u64,
    /// Releases
    pub releases: u64,
    /// Explicit invalidations
    pub invalidations: u64,
    /// Entries removed by expiry sweeps
    pub expired: u64,
}

/// Process-wide identity map
pub struct IdentityMap {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    /// Handle → key of the entry whose canonical object it is
    objects: DashMap<ObjectId, CacheKey>,
    policies: DashMap<EntityType, CacheInvalidationPolicy>,
    default_policy: CacheInvalidationPolicy,
    expiry: Mutex<ExpiryIndex>,
    acquisitions: AtomicU64,
    contentions: AtomicU64,
    releases: AtomicU64,
    invalidations: AtomicU64,
    expired: AtomicU64,
}

impl IdentityMap {
    /// Create an empty map whose entries never expire by default
    pub fn new() -> Self {
        Self::with_default_policy(CacheInvalidationPolicy::NoExpiry)
    }

    /// Create an empty map with a default invalidation policy
    pub fn with_default_policy(default_policy: CacheInvalidationPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            objects: DashMap::new(),
            policies: DashMap::new(),
            default_policy,
            expiry: Mutex::new(ExpiryIndex::new()),
            acquisitions: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Set the invalidation policy for one entity type
    ///
    /// Applies to entries installed or written after the call.
    pub fn set_invalidation_policy(&self, entity: EntityType, policy: CacheInvalidationPolicy) {
        self.policies.insert(entity, policy);
    }

    /// Invalidation policy in effect for an entity type
    pub fn invalidation_policy(&self, entity: &EntityType) -> CacheInvalidationPolicy {
        self.policies
            .get(entity)
            .map(|p| *p.value())
            .unwrap_or(self.default_policy)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Canonical object for `key`, whether or not it is still valid
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<EntityObject>> {
        self.entries.get(key).and_then(|e| e.value().object())
    }

    /// Canonical object for `key` if it is neither invalidated nor expired
    pub fn lookup_valid(&self, key: &CacheKey) -> Option<Arc<EntityObject>> {
        let entry = self.lookup_entry(key)?;
        if entry.is_stale(Timestamp::now()) {
            return None;
        }
        entry.object()
    }

    /// Entry for `key`, if one exists
    pub fn lookup_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Key of the entry whose canonical object has handle `id`
    pub fn key_of(&self, id: ObjectId) -> Option<CacheKey> {
        self.objects.get(&id).map(|k| k.value().clone())
    }

    /// Check if `id` is the canonical object of some entry
    pub fn is_original(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of entries, vacant ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    // ========================================================================
    // Write permits
    // ========================================================================

    /// Acquire the write permit for `key`, creating a vacant entry if absent
    ///
    /// # Arguments
    ///
    /// * `key` - Entry to acquire
    /// * `token` - Owning merge
    /// * `mode` - Whether, and how long, to wait for a held permit
    ///
    /// # Errors
    ///
    /// `AcquireError::Unavailable` in `NoWait` mode when another merge holds
    /// the permit; `AcquireError::TimedOut` when a bounded wait expires.
    pub fn acquire_for_write(
        &self,
        key: &CacheKey,
        token: MergeToken,
        mode: AcquireMode,
    ) -> Result<Arc<CacheEntry>, AcquireError> {
        let started = Instant::now();
        loop {
            let entry = Arc::clone(
                self.entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(CacheEntry::vacant(key.clone())))
                    .value(),
            );

            let acquired = if entry.permit().try_acquire(token) {
                true
            } else {
                self.contentions.fetch_add(1, Ordering::Relaxed);
                match mode {
                    AcquireMode::NoWait => false,
                    AcquireMode::Wait(limit) => {
                        let remaining = limit.map(|l| l.saturating_sub(started.elapsed()));
                        entry.permit().acquire(token, remaining)
                    }
                }
            };

            if !acquired {
                return Err(match mode {
                    AcquireMode::NoWait => AcquireError::Unavailable { key: key.clone() },
                    AcquireMode::Wait(_) => AcquireError::TimedOut {
                        key: key.clone(),
                        waited: started.elapsed(),
                    },
                });
            }

            // The entry may have been removed while we waited for it.
            let current = self
                .entries
                .get(key)
                .map(|e| Arc::ptr_eq(e.value(), &entry))
                .unwrap_or(false);
            if current {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                debug!(target: "coherence::cache", key = %key, token = %token, "write permit acquired");
                return Ok(entry);
            }
            entry.permit().release(token);
        }
    }

    /// Release one level of `token`'s hold on `entry`
    ///
    /// Returns `false` if `token` did not hold the permit. A vacant entry
    /// whose permit becomes free is dropped from the map.
    pub fn release(&self, entry: &Arc<CacheEntry>, token: MergeToken) -> bool {
        if !entry.permit().release(token) {
            return false;
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        if !entry.permit().is_held() && entry.is_vacant() {
            self.entries.remove_if(entry.key(), |_, current| {
                Arc::ptr_eq(current, entry) && current.is_vacant() && !current.permit().is_held()
            });
        }
        debug!(target: "coherence::cache", key = %entry.key(), token = %token, "write permit released");
        true
    }

    fn check_holder(entry: &CacheEntry, token: MergeToken, operation: &str) -> CoherenceResult<()> {
        if entry.is_held_by(token) {
            Ok(())
        } else {
            Err(CoherenceError::illegal_state(format!(
                "{} on {} without holding its write permit",
                operation,
                entry.key()
            )))
        }
    }

    // ========================================================================
    // Entry state
    // ========================================================================

    /// Install a canonical object and its lock value
    ///
    /// Clears the invalidated flag and restarts the invalidation deadline
    /// from `read_time`.
    pub fn install(
        &self,
        entry: &CacheEntry,
        token: MergeToken,
        object: Arc<EntityObject>,
        write_lock_value: Option<WriteLockValue>,
        read_time: Timestamp,
    ) -> CoherenceResult<()> {
        Self::check_holder(entry, token, "install")?;
        let key = entry.key();
        let deadline = self.invalidation_policy(&key.entity).expiry_after(read_time);
        let mut slot = entry.slot.write();
        if let Some(previous) = slot.object.as_ref() {
            if previous.id() != object.id() {
                self.objects.remove(&previous.id());
            }
        }
        self.objects.insert(object.id(), key.clone());
        self.reindex(key, slot.expires_at, deadline);
        slot.object = Some(object);
        slot.write_lock_value = write_lock_value;
        slot.read_time = read_time;
        slot.invalidated = false;
        slot.expires_at = deadline;
        Ok(())
    }

    /// Record a write to the existing canonical object
    ///
    /// Updates the lock value and read time. An invalidated entry stays
    /// invalidated: only `install` of a complete object clears the flag.
    pub fn record_write(
        &self,
        entry: &CacheEntry,
        token: MergeToken,
        write_lock_value: Option<WriteLockValue>,
        read_time: Timestamp,
    ) -> CoherenceResult<()> {
        Self::check_holder(entry, token, "record_write")?;
        let key = entry.key();
        let deadline = self.invalidation_policy(&key.entity).expiry_after(read_time);
        let mut slot = entry.slot.write();
        self.reindex(key, slot.expires_at, deadline);
        if write_lock_value.is_some() {
            slot.write_lock_value = write_lock_value;
        }
        slot.read_time = read_time;
        slot.expires_at = deadline;
        Ok(())
    }

    fn reindex(&self, key: &CacheKey, old: Option<Timestamp>, new: Option<Timestamp>) {
        if old == new {
            return;
        }
        let mut expiry = self.expiry.lock();
        if let Some(old) = old {
            expiry.remove(old, key);
        }
        if let Some(new) = new {
            expiry.insert(new, key.clone());
        }
    }

    /// Mark the entry for `key` stale
    ///
    /// Subsequent merges treat it as having no canonical version. Returns
    /// `false` if there is no entry with an object.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let Some(entry) = self.lookup_entry(key) else {
            return false;
        };
        let mut slot = entry.slot.write();
        if slot.object.is_none() {
            return false;
        }
        slot.invalidated = true;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        warn!(target: "coherence::cache", key = %key, "cache entry invalidated");
        true
    }

    /// Remove the entry held by `token` from the map
    ///
    /// Returns the canonical object it held. The permit stays held by
    /// `token` until released.
    pub fn remove(
        &self,
        entry: &Arc<CacheEntry>,
        token: MergeToken,
    ) -> CoherenceResult<Option<Arc<EntityObject>>> {
        Self::check_holder(entry, token, "remove")?;
        self.entries
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry));
        let mut slot = entry.slot.write();
        let removed = slot.object.take();
        if let Some(object) = removed.as_ref() {
            self.objects.remove(&object.id());
        }
        self.reindex(entry.key(), slot.expires_at, None);
        slot.expires_at = None;
        slot.write_lock_value = None;
        debug!(target: "coherence::cache", key = %entry.key(), "cache entry removed");
        Ok(removed)
    }

    /// Remove every entry whose invalidation deadline passed at `now`
    ///
    /// Entries currently held by a merge are skipped and stay indexed for
    /// the next sweep. Returns the number of entries removed.
    pub fn sweep_expired(&self, now: Timestamp) -> usize {
        let candidates = self.expiry.lock().find_expired(now);
        let sweeper = MergeToken::next();
        let mut removed = 0;
        for (deadline, key) in candidates {
            let Some(entry) = self.lookup_entry(&key) else {
                self.expiry.lock().remove(deadline, &key);
                continue;
            };
            if !entry.permit().try_acquire(sweeper) {
                continue;
            }
            if entry.is_expired(now) && self.remove(&entry, sweeper).is_ok() {
                removed += 1;
            }
            entry.permit().release(sweeper);
        }
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(target: "coherence::cache", removed, "swept expired entries");
        }
        removed
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> IdentityMapStats {
        IdentityMapStats {
            entries: self.entries.len(),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

impl ObjectSpace for IdentityMap {
    fn resolve(&self, id: ObjectId) -> Option<Arc<EntityObject>> {
        let key = self.key_of(id)?;
        self.lookup(&key).filter(|o| o.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::PrimaryKey;

    fn key(id: i64) -> CacheKey {
        CacheKey::new("Employee", PrimaryKey::int(id))
    }

    fn install(map: &IdentityMap, k: &CacheKey, version: u64) -> Arc<EntityObject> {
        let token = MergeToken::next();
        let entry = map.acquire_for_write(k, token, AcquireMode::NoWait).unwrap();
        let obj = EntityObject::empty(k.entity.clone());
        map.install(
            &entry,
            token,
            obj.clone(),
            Some(WriteLockValue::Version(version)),
            Timestamp::now(),
        )
        .unwrap();
        assert!(map.release(&entry, token));
        obj
    }

    #[test]
    fn test_lookup_absent_is_none() {
        let map = IdentityMap::new();
        assert!(map.lookup(&key(1)).is_none());
    }

    #[test]
    fn test_install_then_lookup() {
        let map = IdentityMap::new();
        let obj = install(&map, &key(1), 1);
        let found = map.lookup(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&found, &obj));
        assert_eq!(map.key_of(obj.id()), Some(key(1)));
        assert!(Arc::ptr_eq(&map.resolve(obj.id()).unwrap(), &obj));
    }

    #[test]
    fn test_no_wait_fails_when_held() {
        let map = IdentityMap::new();
        let a = MergeToken::next();
        let b = MergeToken::next();
        let entry = map.acquire_for_write(&key(1), a, AcquireMode::NoWait).unwrap();
        let err = map.acquire_for_write(&key(1), b, AcquireMode::NoWait).unwrap_err();
        assert_eq!(err, AcquireError::Unavailable { key: key(1) });
        assert!(map.release(&entry, a));
        assert_eq!(map.stats().contentions, 1);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let map = IdentityMap::new();
        let a = MergeToken::next();
        let b = MergeToken::next();
        let _entry = map.acquire_for_write(&key(1), a, AcquireMode::NoWait).unwrap();
        let err = map
            .acquire_for_write(&key(1), b, AcquireMode::Wait(Some(Duration::from_millis(10))))
            .unwrap_err();
        assert!(matches!(err, AcquireError::TimedOut { .. }));
        let converted: CoherenceError = err.into();
        assert!(converted.is_retryable());
    }

    #[test]
    fn test_vacant_entry_dropped_on_release() {
        let map = IdentityMap::new();
        let token = MergeToken::next();
        let entry = map.acquire_for_write(&key(1), token, AcquireMode::NoWait).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.release(&entry, token));
        assert!(map.is_empty());
        assert!(!map.release(&entry, token));
    }

    #[test]
    fn test_mutation_requires_permit() {
        let map = IdentityMap::new();
        install(&map, &key(1), 1);
        let entry = map.lookup_entry(&key(1)).unwrap();
        let err = map
            .record_write(&entry, MergeToken::next(), None, Timestamp::now())
            .unwrap_err();
        assert!(matches!(err, CoherenceError::IllegalState { .. }));
    }

    #[test]
    fn test_invalidate_and_reinstall() {
        let map = IdentityMap::new();
        install(&map, &key(1), 1);
        assert!(map.invalidate(&key(1)));
        assert!(map.lookup(&key(1)).is_some());
        assert!(map.lookup_valid(&key(1)).is_none());

        // record_write keeps the entry invalidated
        let token = MergeToken::next();
        let entry = map.acquire_for_write(&key(1), token, AcquireMode::NoWait).unwrap();
        map.record_write(&entry, token, Some(WriteLockValue::Version(2)), Timestamp::now())
            .unwrap();
        assert!(entry.is_invalidated());
        map.release(&entry, token);

        install(&map, &key(1), 3);
        assert!(map.lookup_valid(&key(1)).is_some());
        assert!(!map.invalidate(&key(2)));
    }

    #[test]
    fn test_remove_drops_entry_and_handle() {
        let map = IdentityMap::new();
        let obj = install(&map, &key(1), 1);
        let token = MergeToken::next();
        let entry = map.acquire_for_write(&key(1), token, AcquireMode::NoWait).unwrap();
        let removed = map.remove(&entry, token).unwrap().unwrap();
        assert!(Arc::ptr_eq(&removed, &obj));
        map.release(&entry, token);
        assert!(map.lookup(&key(1)).is_none());
        assert!(!map.is_original(obj.id()));
    }

    #[test]
    fn test_sweep_expired_respects_policy_and_held_permits() {
        let map = IdentityMap::new();
        map.set_invalidation_policy(
            EntityType::new("Employee"),
            CacheInvalidationPolicy::TimeToLive(Duration::from_secs(10)),
        );
        install(&map, &key(1), 1);
        install(&map, &key(2), 1);

        let later = Timestamp::now().saturating_add(Duration::from_secs(60));
        assert!(map.lookup_entry(&key(1)).unwrap().is_expired(later));

        let holder = MergeToken::next();
        let held = map.acquire_for_write(&key(2), holder, AcquireMode::NoWait).unwrap();
        assert_eq!(map.sweep_expired(later), 1);
        assert!(map.lookup(&key(1)).is_none());
        assert!(map.lookup(&key(2)).is_some());

        map.release(&held, holder);
        assert_eq!(map.sweep_expired(later), 1);
        assert!(map.is_empty());
        assert_eq!(map.stats().expired, 2);
    }
}
