//! Clone arms: detached objects into working copies

use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, EntityObject, ObjectId, ValidationKind,
};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{MergeManager, SourceHandle};
use crate::descriptor::EntityDescriptor;

impl<'a> MergeManager<'a> {
    pub(super) fn merge_clone(&mut self, source_id: ObjectId) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::Object(source_id);
        if let Some(done) = self.recorded(handle) {
            return Ok(done);
        }
        if self.registry()?.contains(source_id) {
            self.record(handle, Some(source_id));
            return Ok(Some(source_id));
        }
        let nested = self.is_nested();
        if self.session.cache().is_original(source_id) {
            let kind = if nested {
                ValidationKind::BackupCloneIsOriginalFromParent
            } else {
                ValidationKind::BackupCloneIsOriginalFromSelf
            };
            return Err(CoherenceError::validation(
                kind,
                format!("object {} is a shared-cache original, not a detached copy", source_id),
            ));
        }

        let source = self.source_object(source_id)?;
        let descriptor = self.session.descriptor(source.entity())?;
        // Read-only: the shared original if cached, else the object as is.
        if descriptor.is_read_only() {
            let kept = source
                .with_state(|state| descriptor.cache_key_of(state))
                .and_then(|key| self.cache().lookup(&key))
                .map_or(source_id, |original| original.id());
            self.record(handle, Some(kept));
            return Ok(Some(kept));
        }
        let state = source.snapshot();
        let key = descriptor.cache_key_of(&state);
        if let Some(key) = &key {
            if self.registry()?.is_removed_key(key) {
                return Err(if nested {
                    CoherenceError::validation(
                        ValidationKind::BackupCloneDeleted,
                        format!("{} was deleted in this unit of work", key),
                    )
                } else {
                    CoherenceError::RemovedEntityMerge {
                        object: key.to_string(),
                    }
                });
            }
        }

        let (working, is_new) = self.working_copy_for(&descriptor, key.as_ref(), &state)?;
        self.record(handle, Some(working.id()));

        if let (false, Some(policy), Some(key)) = (is_new, descriptor.locking(), key.as_ref()) {
            let detached = policy.extract(&state);
            let current = working.with_state(|s| policy.extract(s));
            if policy.compare_optional(detached.as_ref(), current.as_ref()) == Ordering::Less {
                warn!(
                    target: "coherence::merge",
                    key = %key,
                    detached = ?detached,
                    current = ?current,
                    "detached object is older than its working copy"
                );
                self.session.merge_metrics().record_conflict();
                return Err(CoherenceError::OptimisticLock {
                    key: key.clone(),
                    expected: detached,
                    found: current,
                });
            }
        }

        let mut target = working.snapshot();
        self.merge_mapped_state(&descriptor, &mut target, is_new, &state)?;
        working.replace_state(target);
        {
            let registry = self.registry()?;
            for mapping in descriptor.mappings() {
                if mapping.as_mergeable().is_some() {
                    registry.mark_changed(working.id(), mapping.attribute());
                }
            }
        }

        self.summary.merged += 1;
        self.session.merge_metrics().record_merged();
        debug!(
            target: "coherence::merge",
            policy = %self.policy,
            source = %source_id,
            working = %working.id(),
            new = is_new,
            "merged detached object"
        );
        Ok(Some(working.id()))
    }

    /// Working copy standing in for a detached object with `key`
    ///
    /// Found among the unit of work's copies, else copied from the shared
    /// original, else registered new.
    fn working_copy_for(
        &mut self,
        descriptor: &EntityDescriptor,
        key: Option<&CacheKey>,
        state: &Attributes,
    ) -> CoherenceResult<(Arc<EntityObject>, bool)> {
        if let Some(key) = key {
            if let Some(existing) = self.find_working_copy(key)? {
                return Ok((existing, false));
            }
            if let Some(original) = self.session.read_original(key)? {
                let descriptors = Arc::clone(self.session.descriptors());
                let cache = self.cache();
                let registry = self.registry()?;
                let id = registry.register_original(&original, &descriptors, &*cache)?;
                let registered = registry
                    .get(id)
                    .cloned()
                    .ok_or(CoherenceError::UnknownObject { id })?;
                return Ok((registered, false));
            }
        }

        if let Some(policy) = descriptor.locking() {
            if let Some(version) = policy.extract(state) {
                if policy.is_newer_than_base(&version) {
                    return Err(CoherenceError::ObjectChangedSinceLastMerge {
                        object: key
                            .map(ToString::to_string)
                            .unwrap_or_else(|| descriptor.entity().to_string()),
                        version,
                    });
                }
            }
        }
        let working = descriptor.build_new_instance();
        self.registry()?
            .register_new(Arc::clone(&working), key.cloned());
        Ok((working, true))
    }

    fn find_working_copy(&mut self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        let registry = self.registry()?;
        Ok(registry
            .find_by_key(key)
            .and_then(|id| registry.get(id).cloned()))
    }

    /// Working copy for a referenced detached object without merging its
    /// state, unless it has no counterpart yet
    pub(super) fn resolve_clone_reference(
        &mut self,
        source_id: ObjectId,
    ) -> CoherenceResult<Option<ObjectId>> {
        if self.registry()?.contains(source_id) {
            return Ok(Some(source_id));
        }
        let Some(source) = self.source_objects()?.resolve(source_id) else {
            return Ok(None);
        };
        let descriptor = self.session.descriptor(source.entity())?;
        let Some(key) = source.with_state(|state| descriptor.cache_key_of(state)) else {
            return self.merge_clone(source_id);
        };
        if let Some(existing) = self.find_working_copy(&key)? {
            return Ok(Some(existing.id()));
        }
        match self.session.read_original(&key)? {
            Some(original) => {
                let descriptors = Arc::clone(self.session.descriptors());
                let cache = self.cache();
                self.registry()?
                    .register_original(&original, &descriptors, &*cache)
                    .map(Some)
            }
            None => self.merge_clone(source_id),
        }
    }
}
