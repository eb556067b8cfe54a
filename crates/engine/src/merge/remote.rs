//! Remote arm: server objects into a remote client's mirror cache

use coherence_cache::CacheEntry;
use coherence_concurrency::LockOutcome;
use coherence_core::{CoherenceError, CoherenceResult, EntityObject, ObjectId};
use std::sync::Arc;

use super::{MergeManager, SourceHandle};
use crate::descriptor::EntityDescriptor;

impl<'a> MergeManager<'a> {
    pub(super) fn merge_refresh_remote(
        &mut self,
        source_id: ObjectId,
    ) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::Object(source_id);
        if let Some(done) = self.recorded(handle) {
            return Ok(done);
        }
        let source = self.source_object(source_id)?;
        let descriptor = self.session.descriptor(source.entity())?;
        let key = source
            .with_state(|state| descriptor.cache_key_of(state))
            .ok_or_else(|| CoherenceError::MissingPrimaryKey {
                entity: source.entity().clone(),
                object: source_id.to_string(),
            })?;

        // Read-only types are mirrored once and never refreshed.
        if descriptor.is_read_only() {
            if let Some(existing) = self.cache().lookup(&key) {
                self.record(handle, Some(existing.id()));
                return Ok(Some(existing.id()));
            }
        }

        match self.acquire(&key)? {
            LockOutcome::Deferred(key) => {
                let target = self
                    .cache()
                    .lookup(&key)
                    .unwrap_or_else(|| descriptor.build_new_instance());
                Ok(Some(self.defer(handle, key, target)))
            }
            LockOutcome::Acquired(entry) => {
                self.refresh_remote_into_entry(&source, &descriptor, &entry, None)
            }
        }
    }

    /// Install the server object's state in the mirror entry
    ///
    /// The entry carries the server's lock value and, when the server
    /// still caches the object, the server entry's read time.
    pub(super) fn refresh_remote_into_entry(
        &mut self,
        source: &Arc<EntityObject>,
        descriptor: &Arc<EntityDescriptor>,
        entry: &Arc<CacheEntry>,
        prebuilt: Option<Arc<EntityObject>>,
    ) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::Object(source.id());
        let token = self.token();
        let cache = self.cache();
        let key = entry.key().clone();
        let target = prebuilt
            .or_else(|| entry.object())
            .unwrap_or_else(|| descriptor.build_new_instance());
        self.record(handle, Some(target.id()));

        let source_state = source.snapshot();
        let mut state = target.snapshot();
        self.merge_mapped_state(descriptor, &mut state, entry.is_vacant(), &source_state)?;
        let write_lock_value = descriptor.locking().and_then(|policy| {
            let value = policy.extract(&source_state);
            if let Some(value) = value {
                state.insert(policy.attribute().to_string(), value.to_value());
            }
            value
        });
        target.replace_state(state);

        let read_time = self
            .session
            .server()
            .and_then(|server| server.cache().lookup_entry(&key))
            .map(|server_entry| server_entry.read_time())
            .unwrap_or(self.read_time);
        cache.install(entry, token, Arc::clone(&target), write_lock_value, read_time)?;
        self.record_merged(&key, &target);
        Ok(Some(target.id()))
    }
}
