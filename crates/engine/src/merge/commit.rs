//! Commit arm: unit-of-work change sets into the shared cache

use coherence_cache::CacheEntry;
use coherence_concurrency::LockOutcome;
use coherence_core::{CacheKey, CoherenceError, CoherenceResult, EntityObject, ObjectId, Timestamp};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{MergeManager, SourceHandle};
use crate::changeset::{ChangeSetId, ObjectChangeSet};
use crate::descriptor::EntityDescriptor;

/// Reject a new object that already carries a lock value newer than the
/// policy's base value
///
/// # Errors
///
/// `ObjectChangedSinceLastMerge` naming the object and its version.
pub(crate) fn check_new_object_version(
    descriptor: &EntityDescriptor,
    change_set: &ObjectChangeSet,
) -> CoherenceResult<()> {
    if let (Some(policy), Some(initial)) = (descriptor.locking(), change_set.initial_write_lock_value)
    {
        if policy.is_newer_than_base(&initial) {
            return Err(CoherenceError::ObjectChangedSinceLastMerge {
                object: change_set.describe(),
                version: initial,
            });
        }
    }
    Ok(())
}

pub(crate) fn missing_key(change_set: &ObjectChangeSet) -> CoherenceError {
    CoherenceError::MissingPrimaryKey {
        entity: change_set.entity.clone(),
        object: change_set.describe(),
    }
}

impl<'a> MergeManager<'a> {
    pub(super) fn merge_commit(&mut self, id: ChangeSetId) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::ChangeSet(id);
        if let Some(done) = self.recorded(handle) {
            return Ok(done);
        }
        let change_set = self.object_change_set(id)?;
        let descriptor = self.session.descriptor(&change_set.entity)?;
        if descriptor.is_aggregate() || change_set.is_aggregate {
            self.record(handle, None);
            return Ok(None);
        }
        let key = change_set
            .key
            .clone()
            .ok_or_else(|| missing_key(change_set))?;
        let cache = self.cache();

        if descriptor.is_read_only() {
            let existing = cache.lookup(&key).map(|o| o.id());
            self.record(handle, existing);
            return Ok(existing);
        }

        if change_set.should_be_deleted {
            return match self.acquire(&key)? {
                LockOutcome::Deferred(key) => {
                    self.defer(handle, key, descriptor.build_new_instance());
                    Ok(None)
                }
                LockOutcome::Acquired(entry) => self.remove_entry(handle, &entry),
            };
        }

        // Referenced but unchanged: keep the cached identity, valid or not.
        if !change_set.is_new && !change_set.has_changes() {
            if let Some(existing) = cache.lookup(&key) {
                self.record(handle, Some(existing.id()));
                return Ok(Some(existing.id()));
            }
        }

        if change_set.is_new {
            check_new_object_version(&descriptor, change_set)?;
        }

        match self.acquire(&key)? {
            LockOutcome::Deferred(key) => {
                let target = (!change_set.is_new)
                    .then(|| cache.lookup(&key))
                    .flatten()
                    .unwrap_or_else(|| descriptor.build_new_instance());
                Ok(Some(self.defer(handle, key, target)))
            }
            LockOutcome::Acquired(entry) => {
                self.commit_into_entry(change_set, &descriptor, &entry, None)
            }
        }
    }

    /// Merge `change_set` into the entry this merge holds
    ///
    /// A lost update, where the entry's lock value is not the one the unit
    /// of work started from, invalidates the entry instead of merging.
    pub(super) fn commit_into_entry(
        &mut self,
        change_set: &ObjectChangeSet,
        descriptor: &Arc<EntityDescriptor>,
        entry: &Arc<CacheEntry>,
        prebuilt: Option<Arc<EntityObject>>,
    ) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::ChangeSet(change_set.id);
        let token = self.token();
        let cache = self.cache();
        let key = entry.key().clone();
        let existing = entry.object();

        if change_set.is_invalid {
            debug!(target: "coherence::merge", key = %key, "change set marked invalid, invalidating entry");
            return Ok(self.invalidate_and_keep(handle, &key, existing.as_deref()));
        }

        let stale = entry.is_stale(Timestamp::now());
        if !change_set.is_new && !stale {
            if let Some(policy) = descriptor.locking() {
                let current = entry.write_lock_value();
                let expected = change_set.initial_write_lock_value;
                if policy.compare_optional(expected.as_ref(), current.as_ref()) != Ordering::Equal {
                    warn!(
                        target: "coherence::merge",
                        key = %key,
                        expected = ?expected,
                        found = ?current,
                        "lost update detected, invalidating instead of merging"
                    );
                    self.session.merge_metrics().record_conflict();
                    return Ok(self.invalidate_and_keep(handle, &key, existing.as_deref()));
                }
            }
        }

        let target = prebuilt
            .or_else(|| existing.clone())
            .unwrap_or_else(|| descriptor.build_new_instance());
        self.record(handle, Some(target.id()));

        let replaced = existing.as_ref().map_or(true, |e| e.id() != target.id());
        let whole = stale || change_set.is_new || replaced;
        let clone = change_set
            .clone_id
            .and_then(|id| self.source_clones().and_then(|clones| clones.resolve(id)));

        if whole && clone.is_none() && !change_set.is_new {
            debug!(target: "coherence::merge", key = %key, "no working copy to rebuild stale entry from, leaving it");
            self.summary.skipped += 1;
            let kept = existing.map(|o| o.id());
            self.record(handle, kept);
            return Ok(kept);
        }

        let mut state = target.snapshot();
        match clone.filter(|_| whole) {
            Some(clone) => {
                let source = clone.snapshot();
                self.merge_mapped_state(descriptor, &mut state, change_set.is_new, &source)?;
            }
            None => self.apply_records(descriptor, &mut state, change_set)?,
        }

        let write_lock_value = descriptor.locking().and_then(|policy| {
            let value = change_set.write_lock_value;
            if let Some(value) = value {
                state.insert(policy.attribute().to_string(), value.to_value());
            }
            value
        });
        target.replace_state(state);

        if whole {
            cache.install(entry, token, Arc::clone(&target), write_lock_value, self.read_time)?;
        } else {
            cache.record_write(entry, token, write_lock_value, self.read_time)?;
        }
        self.record_merged(&key, &target);
        Ok(Some(target.id()))
    }

    fn invalidate_and_keep(
        &mut self,
        handle: SourceHandle,
        key: &CacheKey,
        existing: Option<&EntityObject>,
    ) -> Option<ObjectId> {
        self.invalidate(key);
        let kept = existing.map(|o| o.id());
        self.record(handle, kept);
        kept
    }

    /// Resolve a working copy that has no change set to its cached original
    pub(super) fn resolve_unchanged_clone(
        &mut self,
        clone_id: ObjectId,
    ) -> CoherenceResult<Option<ObjectId>> {
        let cache = self.cache();
        if cache.is_original(clone_id) {
            return Ok(Some(clone_id));
        }
        let Some(clone) = self.source_clones().and_then(|clones| clones.resolve(clone_id)) else {
            return Ok(None);
        };
        let descriptor = self.session.descriptor(clone.entity())?;
        let key = clone.with_state(|state| descriptor.cache_key_of(state));
        Ok(key.and_then(|key| cache.lookup(&key)).map(|o| o.id()))
    }
}
