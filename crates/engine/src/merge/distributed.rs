//! Distributed arm: a cooperating cache's change set into the shared cache
//!
//! Incoming change sets carry no working copies, so only their records can
//! be applied. Whenever applying them could leave the local entry
//! inconsistent, the entry is invalidated and the next read reloads it.

use coherence_cache::CacheEntry;
use coherence_concurrency::LockOutcome;
use coherence_core::{Attributes, CoherenceResult, EntityObject, ObjectId, Timestamp};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::commit::missing_key;
use super::{MergeManager, SourceHandle};
use crate::changeset::{ChangeSetId, ObjectChangeSet};
use crate::descriptor::{CacheSynchronizationType, EntityDescriptor};

impl<'a> MergeManager<'a> {
    pub(super) fn merge_distributed(
        &mut self,
        id: ChangeSetId,
    ) -> CoherenceResult<Option<ObjectId>> {
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

        match change_set.sync_type {
            CacheSynchronizationType::InvalidateChangedObjects => {
                self.invalidate(&key);
                let existing = cache.lookup(&key).map(|o| o.id());
                self.record(handle, existing);
                return Ok(existing);
            }
            CacheSynchronizationType::DoNotSend => {
                let existing = cache.lookup(&key).map(|o| o.id());
                self.record(handle, existing);
                return Ok(existing);
            }
            CacheSynchronizationType::SendObjectChanges
            | CacheSynchronizationType::SendNewObjectsWithChanges => {}
        }

        // Reference stub: resolve to whatever this cache holds.
        if !change_set.has_changes() && !change_set.should_be_deleted && !change_set.is_new {
            let existing = cache.lookup_valid(&key).map(|o| o.id());
            self.record(handle, existing);
            return Ok(existing);
        }

        match self.acquire(&key)? {
            LockOutcome::Deferred(key) => {
                let target = cache
                    .lookup(&key)
                    .unwrap_or_else(|| descriptor.build_new_instance());
                Ok(Some(self.defer(handle, key, target)))
            }
            LockOutcome::Acquired(entry) => {
                self.distributed_into_entry(change_set, &descriptor, &entry, None)
            }
        }
    }

    pub(super) fn distributed_into_entry(
        &mut self,
        change_set: &ObjectChangeSet,
        descriptor: &Arc<EntityDescriptor>,
        entry: &Arc<CacheEntry>,
        prebuilt: Option<Arc<EntityObject>>,
    ) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::ChangeSet(change_set.id);
        if change_set.should_be_deleted {
            return self.remove_entry(handle, entry);
        }
        let token = self.token();
        let cache = self.cache();
        let key = entry.key().clone();
        let current = entry
            .object()
            .filter(|_| !entry.is_stale(Timestamp::now()));

        match current {
            Some(object) => {
                self.record(handle, Some(object.id()));
                if let Some(policy) = descriptor.locking() {
                    let local = entry.write_lock_value();
                    match policy.compare_optional(local.as_ref(), change_set.write_lock_value.as_ref())
                    {
                        Ordering::Equal => {
                            debug!(target: "coherence::sync", key = %key, "entry already current");
                            self.summary.skipped += 1;
                            return Ok(Some(object.id()));
                        }
                        Ordering::Greater => {
                            warn!(target: "coherence::sync", key = %key, "local entry ahead of incoming change, invalidating");
                            self.invalidate(&key);
                            return Ok(Some(object.id()));
                        }
                        Ordering::Less => {}
                    }
                    let expected = change_set.initial_write_lock_value;
                    if policy.compare_optional(local.as_ref(), expected.as_ref()) != Ordering::Equal {
                        warn!(
                            target: "coherence::sync",
                            key = %key,
                            local = ?local,
                            expected = ?expected,
                            "missed an intermediate change, invalidating"
                        );
                        self.invalidate(&key);
                        return Ok(Some(object.id()));
                    }
                }

                let mut state = object.snapshot();
                let unresolved = self.unresolved;
                self.apply_records(descriptor, &mut state, change_set)?;
                if self.unresolved > unresolved {
                    warn!(target: "coherence::sync", key = %key, "incoming change references unknown objects, invalidating");
                    self.invalidate(&key);
                    return Ok(Some(object.id()));
                }
                let write_lock_value = self.stamp_write_value(descriptor, &mut state, change_set);
                object.replace_state(state);
                cache.record_write(entry, token, write_lock_value, self.read_time)?;
                self.record_merged(&key, &object);
                Ok(Some(object.id()))
            }
            None if change_set.is_new => {
                let target = prebuilt
                    .or_else(|| entry.object())
                    .unwrap_or_else(|| descriptor.build_new_instance());
                self.record(handle, Some(target.id()));

                let mut state = Attributes::new();
                let unresolved = self.unresolved;
                self.apply_records(descriptor, &mut state, change_set)?;
                if self.unresolved > unresolved {
                    warn!(target: "coherence::sync", key = %key, "new object references unknown objects, not installing");
                    self.summary.skipped += 1;
                    self.record(handle, None);
                    return Ok(None);
                }
                let write_lock_value = self.stamp_write_value(descriptor, &mut state, change_set);
                target.replace_state(state);
                cache.install(entry, token, Arc::clone(&target), write_lock_value, self.read_time)?;
                self.record_merged(&key, &target);
                Ok(Some(target.id()))
            }
            None => {
                debug!(target: "coherence::sync", key = %key, "no current object for incoming change, next read loads it");
                self.summary.skipped += 1;
                let existing = entry.object().map(|o| o.id());
                self.record(handle, existing);
                Ok(existing)
            }
        }
    }

    fn stamp_write_value(
        &self,
        descriptor: &EntityDescriptor,
        state: &mut Attributes,
        change_set: &ObjectChangeSet,
    ) -> Option<coherence_core::WriteLockValue> {
        let policy = descriptor.locking()?;
        let value = change_set.write_lock_value?;
        state.insert(policy.attribute().to_string(), value.to_value());
        Some(value)
    }
}
