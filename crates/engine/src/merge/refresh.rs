//! Refresh arm: shared-cache originals into working copies

use coherence_core::{CoherenceResult, ObjectId};
use std::sync::Arc;
use tracing::debug;

use super::{MergeManager, SourceHandle};

impl<'a> MergeManager<'a> {
    pub(super) fn merge_refresh(&mut self, original_id: ObjectId) -> CoherenceResult<Option<ObjectId>> {
        let handle = SourceHandle::Object(original_id);
        if let Some(done) = self.recorded(handle) {
            return Ok(done);
        }
        let originals = self.source_objects()?;
        let Some(original) = originals.resolve(original_id) else {
            self.record(handle, None);
            return Ok(None);
        };
        let descriptor = self.session.descriptor(original.entity())?;
        if descriptor.is_read_only() {
            self.record(handle, Some(original_id));
            return Ok(Some(original_id));
        }
        let key = original.with_state(|state| descriptor.cache_key_of(state));

        let existing = {
            let registry = self.registry()?;
            let found = registry
                .clone_of(original_id)
                .or_else(|| key.as_ref().and_then(|k| registry.find_by_key(k)));
            if let Some(clone_id) = found {
                registry.bind_original(clone_id, original_id);
            }
            found.and_then(|id| registry.get(id).cloned())
        };

        let Some(clone) = existing else {
            let descriptors = Arc::clone(self.session.descriptors());
            let clone_id = self
                .registry()?
                .register_original(&original, &descriptors, originals)?;
            self.record(handle, Some(clone_id));
            self.summary.merged += 1;
            return Ok(Some(clone_id));
        };
        self.record(handle, Some(clone.id()));

        let source = original.snapshot();
        let mut state = clone.snapshot();
        self.merge_mapped_state(&descriptor, &mut state, false, &source)?;
        if let Some(policy) = descriptor.locking() {
            match source.get(policy.attribute()) {
                Some(value) => {
                    state.insert(policy.attribute().to_string(), value.clone());
                }
                None => {
                    state.remove(policy.attribute());
                }
            }
        }
        clone.replace_state(state.clone());
        self.registry()?.reset_backup(clone.id(), state);

        self.summary.merged += 1;
        self.session.merge_metrics().record_merged();
        debug!(target: "coherence::merge", original = %original_id, clone = %clone.id(), "refreshed working copy");
        Ok(Some(clone.id()))
    }

    /// Working copy for a referenced original, registered if absent
    pub(super) fn resolve_refresh_reference(
        &mut self,
        original_id: ObjectId,
    ) -> CoherenceResult<Option<ObjectId>> {
        if let Some(clone_id) = self.registry()?.clone_of(original_id) {
            return Ok(Some(clone_id));
        }
        let originals = self.source_objects()?;
        let Some(original) = originals.resolve(original_id) else {
            return Ok(None);
        };
        if self.session.descriptor(original.entity())?.is_read_only() {
            return Ok(Some(original_id));
        }
        let descriptors = Arc::clone(self.session.descriptors());
        self.registry()?
            .register_original(&original, &descriptors, originals)
            .map(Some)
    }
}
