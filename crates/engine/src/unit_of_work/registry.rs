//! Working-copy registry
//!
//! Tracks a unit of work's working copies ("clones"): which original each
//! was copied from, its backup state for change computation, and its
//! new/deleted/forced flags. Lookups by key and by original never consult
//! the shared cache.

use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, EntityObject, ObjectId, ObjectSpace,
    Value,
};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::descriptor::DescriptorRegistry;

/// Working copies of one unit of work
#[derive(Debug, Default)]
pub struct CloneRegistry {
    clones: FxHashMap<ObjectId, Arc<EntityObject>>,
    original_of: FxHashMap<ObjectId, ObjectId>,
    clone_of: FxHashMap<ObjectId, ObjectId>,
    by_key: BTreeMap<CacheKey, ObjectId>,
    keys: FxHashMap<ObjectId, CacheKey>,
    backups: FxHashMap<ObjectId, Attributes>,
    new_objects: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    forced: BTreeSet<ObjectId>,
    removed_keys: BTreeSet<CacheKey>,
    changed: FxHashMap<ObjectId, BTreeSet<String>>,
}

impl CloneRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `id` is a registered working copy
    pub fn contains(&self, id: ObjectId) -> bool {
        self.clones.contains_key(&id)
    }

    /// Working copy with handle `id`
    pub fn get(&self, id: ObjectId) -> Option<&Arc<EntityObject>> {
        self.clones.get(&id)
    }

    /// Number of working copies
    pub fn len(&self) -> usize {
        self.clones.len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.clones.is_empty()
    }

    /// Working-copy handles in ascending order
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.clones.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Original the working copy `clone_id` was copied from
    pub fn original_of(&self, clone_id: ObjectId) -> Option<ObjectId> {
        self.original_of.get(&clone_id).copied()
    }

    /// Working copy of the original `original_id`
    pub fn clone_of(&self, original_id: ObjectId) -> Option<ObjectId> {
        self.clone_of.get(&original_id).copied()
    }

    /// Working copy registered under `key`
    pub fn find_by_key(&self, key: &CacheKey) -> Option<ObjectId> {
        self.by_key.get(key).copied()
    }

    /// Key the working copy was registered under
    pub fn key_of(&self, clone_id: ObjectId) -> Option<&CacheKey> {
        self.keys.get(&clone_id)
    }

    /// Backup state of an existing working copy
    pub fn backup(&self, clone_id: ObjectId) -> Option<&Attributes> {
        self.backups.get(&clone_id)
    }

    /// Check if the working copy is new to the data store
    pub fn is_new(&self, clone_id: ObjectId) -> bool {
        self.new_objects.contains(&clone_id)
    }

    /// Check if the working copy is scheduled for deletion
    pub fn is_deleted(&self, clone_id: ObjectId) -> bool {
        self.deleted.contains(&clone_id)
    }

    /// Check if the working copy's version is bumped even without changes
    pub fn is_forced(&self, clone_id: ObjectId) -> bool {
        self.forced.contains(&clone_id)
    }

    /// Check if the object with `key` was deleted by this unit of work
    pub fn is_removed_key(&self, key: &CacheKey) -> bool {
        self.removed_keys.contains(key)
    }

    /// Attributes written through the unit of work since the last flush
    pub fn changed_attributes(&self, clone_id: ObjectId) -> Option<&BTreeSet<String>> {
        self.changed.get(&clone_id)
    }

    /// Working copies scheduled for deletion, ascending
    pub fn deleted(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.deleted.iter().copied()
    }

    /// New working copies, ascending
    pub fn new_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.new_objects.iter().copied()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn insert(
        &mut self,
        clone: Arc<EntityObject>,
        original: Option<ObjectId>,
        key: Option<CacheKey>,
        backup: Option<Attributes>,
    ) -> ObjectId {
        let id = clone.id();
        if let Some(original) = original {
            self.original_of.insert(id, original);
            self.clone_of.insert(original, id);
        }
        if let Some(key) = key {
            self.by_key.insert(key.clone(), id);
            self.keys.insert(id, key);
        }
        if let Some(backup) = backup {
            self.backups.insert(id, backup);
        }
        self.clones.insert(id, clone);
        id
    }

    /// Register `object` as a new working copy
    pub fn register_new(&mut self, object: Arc<EntityObject>, key: Option<CacheKey>) -> ObjectId {
        let id = self.insert(object, None, key, None);
        self.new_objects.insert(id);
        debug!(target: "coherence::uow", object = %id, "registered new object");
        id
    }

    /// Register a working copy of `original` and of every original it
    /// reaches
    ///
    /// Registration runs in two passes: every reachable original first
    /// gets an empty working copy, then each copy is populated with its
    /// original's state, references translated to the copies. Cycles
    /// therefore resolve to the same copies. Originals already registered
    /// keep their existing working copy. Read-only entities are not copied:
    /// the original itself is registered.
    ///
    /// # Arguments
    ///
    /// * `original` - Shared object to copy
    /// * `descriptors` - Descriptors of every reachable entity
    /// * `originals` - Space resolving the originals' references
    ///
    /// # Errors
    ///
    /// `DescriptorNotFound` for an entity without a descriptor.
    pub fn register_original(
        &mut self,
        original: &Arc<EntityObject>,
        descriptors: &DescriptorRegistry,
        originals: &dyn ObjectSpace,
    ) -> CoherenceResult<ObjectId> {
        if let Some(existing) = self.clone_of(original.id()) {
            return Ok(existing);
        }

        let mut shells: FxHashMap<ObjectId, Arc<EntityObject>> = FxHashMap::default();
        let mut discovered = Vec::new();
        let mut pending = vec![Arc::clone(original)];
        while let Some(next) = pending.pop() {
            if shells.contains_key(&next.id()) || self.clone_of.contains_key(&next.id()) {
                continue;
            }
            let descriptor = descriptors.describe(next.entity())?;
            let shell = if descriptor.is_read_only() {
                Arc::clone(&next)
            } else {
                descriptor.build_new_instance()
            };
            shells.insert(next.id(), shell);
            let referenced = next.with_state(|state| {
                state
                    .values()
                    .flat_map(Value::referenced_ids)
                    .collect::<Vec<_>>()
            });
            for id in referenced {
                if let Some(target) = originals.resolve(id) {
                    pending.push(target);
                }
            }
            discovered.push((next, descriptor));
        }

        for (source, descriptor) in discovered {
            let shell = shells
                .get(&source.id())
                .map(Arc::clone)
                .ok_or_else(|| CoherenceError::internal("working copy shell missing"))?;
            let state = source.snapshot();
            let key = descriptor.cache_key_of(&state);
            if descriptor.is_read_only() {
                self.insert(shell, Some(source.id()), key, None);
                continue;
            }
            let copied = {
                let existing = &self.clone_of;
                descriptor.populate_attributes_for_clone(&state, &mut |id| {
                    Ok(shells
                        .get(&id)
                        .map(|s| s.id())
                        .or_else(|| existing.get(&id).copied())
                        .unwrap_or(id))
                })?
            };
            shell.replace_state(copied.clone());
            self.insert(shell, Some(source.id()), key, Some(copied));
        }

        let registered = self
            .clone_of(original.id())
            .ok_or_else(|| CoherenceError::internal("registered original has no working copy"))?;
        debug!(
            target: "coherence::uow",
            original = %original.id(),
            clone = %registered,
            total = self.clones.len(),
            "registered existing object"
        );
        Ok(registered)
    }

    /// Point the working copy `clone_id` at a different original
    pub(crate) fn bind_original(&mut self, clone_id: ObjectId, original_id: ObjectId) {
        if let Some(previous) = self.original_of.insert(clone_id, original_id) {
            if previous != original_id {
                self.clone_of.remove(&previous);
            }
        }
        self.clone_of.insert(original_id, clone_id);
    }

    /// Register the working copy under `key`
    pub(crate) fn set_key(&mut self, clone_id: ObjectId, key: CacheKey) {
        if let Some(previous) = self.keys.insert(clone_id, key.clone()) {
            if previous != key {
                self.by_key.remove(&previous);
            }
        }
        self.by_key.insert(key, clone_id);
    }

    /// Replace the backup state, making the working copy unchanged
    pub fn reset_backup(&mut self, clone_id: ObjectId, state: Attributes) {
        self.backups.insert(clone_id, state);
        self.changed.remove(&clone_id);
    }

    /// Record a write to `attribute` through the unit of work
    pub(crate) fn mark_changed(&mut self, clone_id: ObjectId, attribute: impl Into<String>) {
        self.changed
            .entry(clone_id)
            .or_default()
            .insert(attribute.into());
    }

    /// Schedule the working copy for deletion
    pub(crate) fn mark_deleted(&mut self, clone_id: ObjectId) {
        self.deleted.insert(clone_id);
        if let Some(key) = self.keys.get(&clone_id) {
            self.removed_keys.insert(key.clone());
        }
    }

    /// Undo a scheduled deletion and forced bump
    pub(crate) fn restore(&mut self, clone_id: ObjectId) {
        self.deleted.remove(&clone_id);
        self.forced.remove(&clone_id);
        if let Some(key) = self.keys.get(&clone_id) {
            self.removed_keys.remove(key);
        }
    }

    /// Bump the working copy's version at the next flush
    pub(crate) fn mark_forced(&mut self, clone_id: ObjectId) {
        self.forced.insert(clone_id);
    }

    /// Drop a working copy entirely
    pub(crate) fn unregister(&mut self, clone_id: ObjectId) -> Option<Arc<EntityObject>> {
        let removed = self.clones.remove(&clone_id)?;
        if let Some(original) = self.original_of.remove(&clone_id) {
            self.clone_of.remove(&original);
        }
        if let Some(key) = self.keys.remove(&clone_id) {
            self.by_key.remove(&key);
        }
        self.backups.remove(&clone_id);
        self.new_objects.remove(&clone_id);
        self.deleted.remove(&clone_id);
        self.forced.remove(&clone_id);
        self.changed.remove(&clone_id);
        Some(removed)
    }

    /// Record that the working copies' changes reached the data store
    ///
    /// New objects become existing ones with `state` as their backup;
    /// forced bumps and write tracking are cleared.
    pub(crate) fn mark_flushed(&mut self, clone_id: ObjectId, state: Attributes) {
        self.new_objects.remove(&clone_id);
        self.forced.remove(&clone_id);
        self.reset_backup(clone_id, state);
    }
}

impl ObjectSpace for CloneRegistry {
    fn resolve(&self, id: ObjectId) -> Option<Arc<EntityObject>> {
        self.clones.get(&id).cloned()
    }
}
