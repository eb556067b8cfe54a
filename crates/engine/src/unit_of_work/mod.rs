//! Unit of work
//!
//! A [`UnitOfWork`] edits working copies of shared objects in isolation.
//! Reading registers a working copy of the canonical object (and of every
//! object it reaches); writes go to the copies only. At flush the copies
//! are compared with their backups to produce a change set, and at commit
//! the accumulated change set is validated and merged into the shared
//! cache.
//!
//! # Lifecycle
//!
//! ```text
//! Active ──commit──▶ Committed
//!   │  └──commit error──▶ Failed
//!   └──release──▶ Released
//! ```
//!
//! Every operation other than the status accessors fails with
//! `IllegalState` once the unit of work has left `Active`.

mod registry;

pub use registry::CloneRegistry;

use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, EntityObject, ObjectGraph, ObjectId,
    ObjectSpace, Value, ValidationKind,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::changeset::{ChangeContext, ChangeRecord, UnitOfWorkChangeSet};
use crate::descriptor::{AttributeMapping, ChangeTrackingPolicy};
use crate::merge::{CascadePolicy, MergeManager, MergePolicy, MergeSource, MergeSummary, MergeTarget};
use crate::session::Session;

/// Where a unit of work is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkStatus {
    /// Accepting reads and writes
    Active,
    /// Changes merged into the shared cache
    Committed,
    /// Discarded by the caller
    Released,
    /// A commit failed; nothing was merged
    Failed,
}

impl fmt::Display for UnitOfWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitOfWorkStatus::Active => "active",
            UnitOfWorkStatus::Committed => "committed",
            UnitOfWorkStatus::Released => "released",
            UnitOfWorkStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Isolated working copies and their accumulated changes
pub struct UnitOfWork {
    session: Session,
    registry: CloneRegistry,
    cumulative: UnitOfWorkChangeSet,
    status: UnitOfWorkStatus,
    suppress_validation: bool,
}

impl UnitOfWork {
    pub(crate) fn new(session: Session) -> Self {
        let suppress_validation = session.config().suppress_validation;
        Self {
            cumulative: UnitOfWorkChangeSet::new(session.id()),
            session,
            registry: CloneRegistry::new(),
            status: UnitOfWorkStatus::Active,
            suppress_validation,
        }
    }

    /// Owning session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Lifecycle status
    pub fn status(&self) -> UnitOfWorkStatus {
        self.status
    }

    /// Check if the unit of work accepts operations
    pub fn is_active(&self) -> bool {
        self.status == UnitOfWorkStatus::Active
    }

    /// Working copies
    pub fn registry(&self) -> &CloneRegistry {
        &self.registry
    }

    /// Working copy with handle `id`
    pub fn working_copy(&self, id: ObjectId) -> Option<Arc<EntityObject>> {
        self.registry.get(id).cloned()
    }

    /// Changes flushed so far
    pub fn change_set(&self) -> &UnitOfWorkChangeSet {
        &self.cumulative
    }

    /// Swallow suppressible validation errors in this unit of work's merges
    pub fn set_suppress_validation(&mut self, suppress: bool) {
        self.suppress_validation = suppress;
    }

    fn check_active(&self) -> CoherenceResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoherenceError::illegal_state(format!(
                "unit of work is {}",
                self.status
            )))
        }
    }

    fn require_registered(&self, id: ObjectId) -> CoherenceResult<Arc<EntityObject>> {
        self.registry.get(id).cloned().ok_or_else(|| {
            CoherenceError::validation(
                ValidationKind::ObjectNotRegistered,
                format!("object {} is not registered in this unit of work", id),
            )
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Working copy of the object with `key`
    ///
    /// Objects deleted in this unit of work read as absent.
    ///
    /// # Errors
    ///
    /// Propagates read failures from the session.
    pub fn read_object(&mut self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.check_active()?;
        if self.registry.is_removed_key(key) {
            return Ok(None);
        }
        if let Some(id) = self.registry.find_by_key(key) {
            return Ok(self.registry.get(id).cloned());
        }
        match self.session.read_original(key)? {
            Some(original) => self.register_existing(&original).map(Some),
            None => Ok(None),
        }
    }

    /// Working copy of a shared-cache original
    pub fn register_existing(
        &mut self,
        original: &Arc<EntityObject>,
    ) -> CoherenceResult<Arc<EntityObject>> {
        self.check_active()?;
        let cache = Arc::clone(self.session.cache());
        let descriptors = Arc::clone(self.session.descriptors());
        let id = self
            .registry
            .register_original(original, &descriptors, cache.as_ref())?;
        self.require_registered(id)
    }

    /// Register `object` as new; it becomes its own working copy
    ///
    /// # Errors
    ///
    /// `Validation(ObjectAlreadyExists)` if a live working copy has the
    /// same key; `InvalidInput` for a shared-cache original.
    pub fn register_new_object(
        &mut self,
        object: Arc<EntityObject>,
    ) -> CoherenceResult<Arc<EntityObject>> {
        self.check_active()?;
        if self.registry.contains(object.id()) {
            return Ok(object);
        }
        if self.session.cache().is_original(object.id()) {
            return Err(CoherenceError::invalid_input(format!(
                "object {} is a shared-cache original",
                object.id()
            )));
        }
        let descriptor = self.session.descriptor(object.entity())?;
        let key = object.with_state(|state| descriptor.cache_key_of(state));
        if let Some(key) = &key {
            if let Some(existing) = self.registry.find_by_key(key) {
                if !self.registry.is_deleted(existing) {
                    return Err(CoherenceError::validation(
                        ValidationKind::ObjectAlreadyExists,
                        format!("{} is already registered", key),
                    ));
                }
            }
        }
        self.registry.register_new(Arc::clone(&object), key);
        Ok(object)
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Write `attribute` of a working copy
    pub fn set_attribute(
        &mut self,
        clone_id: ObjectId,
        attribute: &str,
        value: impl Into<Value>,
    ) -> CoherenceResult<()> {
        self.check_active()?;
        let clone = self.require_registered(clone_id)?;
        clone.set(attribute, value);
        self.registry.mark_changed(clone_id, attribute);
        Ok(())
    }

    /// Schedule a working copy for deletion
    ///
    /// Privately owned parts are deleted with it. A new object is simply
    /// unregistered.
    pub fn delete_object(&mut self, clone_id: ObjectId) -> CoherenceResult<()> {
        self.check_active()?;
        self.require_registered(clone_id)?;
        let mut visited = FxHashSet::default();
        let mut pending = vec![clone_id];
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(clone) = self.registry.get(id).cloned() else {
                continue;
            };
            let descriptor = self.session.descriptor(clone.entity())?;
            for mapping in descriptor.mappings() {
                if !mapping.is_private_owned() {
                    continue;
                }
                if let Some(cascadable) = mapping.as_cascadable() {
                    pending.extend(clone.with_state(|state| cascadable.cascade_targets(state)));
                }
            }
            if self.registry.is_new(id) {
                self.registry.unregister(id);
            } else {
                self.registry.mark_deleted(id);
            }
            debug!(target: "coherence::uow", object = %id, "scheduled for deletion");
        }
        Ok(())
    }

    /// Bump the object's version at commit even without attribute changes
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the entity has no optimistic locking policy.
    pub fn force_version_update(&mut self, clone_id: ObjectId) -> CoherenceResult<()> {
        self.check_active()?;
        let clone = self.require_registered(clone_id)?;
        let descriptor = self.session.descriptor(clone.entity())?;
        if descriptor.locking().is_none() {
            return Err(CoherenceError::invalid_input(format!(
                "{} has no optimistic locking policy",
                descriptor.entity()
            )));
        }
        self.registry.mark_forced(clone_id);
        Ok(())
    }

    // ========================================================================
    // Change computation
    // ========================================================================

    /// Compare every working copy with its backup
    ///
    /// The working copies are left untouched; the result covers changes
    /// since the last flush. Existing objects with changes get the next
    /// lock value as their write value.
    pub fn calculate_changes(&self) -> CoherenceResult<UnitOfWorkChangeSet> {
        self.check_active()?;
        let descriptors = Arc::clone(self.session.descriptors());
        let mut change_set = UnitOfWorkChangeSet::new(self.session.id());
        let empty = Attributes::new();
        {
            let mut ctx = ChangeContext::new(
                &mut change_set,
                &self.registry,
                &descriptors,
                self.session.default_sync(),
            );
            for id in self.registry.ids() {
                let Some(clone) = self.registry.get(id) else {
                    continue;
                };
                let descriptor = descriptors.describe(clone.entity())?;
                if descriptor.is_read_only()
                    || descriptor.is_aggregate()
                    || self.registry.original_of(id) == Some(id)
                {
                    continue;
                }
                if self.registry.is_deleted(id) {
                    let object = ctx.change_set_for(id)?;
                    if let Some(object) = ctx.change_set().get_mut(object) {
                        object.should_be_deleted = true;
                    }
                    continue;
                }

                let is_new = self.registry.is_new(id);
                let forced = self.registry.is_forced(id);
                let backup = if is_new {
                    &empty
                } else {
                    match self.registry.backup(id) {
                        Some(backup) => backup,
                        None => continue,
                    }
                };
                let tracked = self.registry.changed_attributes(id);
                let candidates: Vec<&Arc<dyn AttributeMapping>> = descriptor
                    .mappings()
                    .iter()
                    .filter(|m| match descriptor.change_tracking() {
                        _ if is_new => true,
                        ChangeTrackingPolicy::Deferred => true,
                        ChangeTrackingPolicy::ObjectLevel => tracked.is_some(),
                        ChangeTrackingPolicy::AttributeLevel => {
                            tracked.map_or(false, |t| t.contains(m.attribute()))
                        }
                    })
                    .collect();

                let state = clone.snapshot();
                let mut records: Vec<ChangeRecord> = Vec::new();
                for mapping in candidates {
                    if mapping.is_read_only() && !is_new {
                        continue;
                    }
                    if let Some(comparable) = mapping.as_comparable() {
                        if let Some(record) = comparable.compare_for_change(&state, backup, &mut ctx)? {
                            records.push(record);
                        }
                    }
                }
                if records.is_empty() && !is_new && !forced {
                    continue;
                }
                let object = ctx.change_set_for(id)?;
                for record in records {
                    ctx.change_set().record_change(object, record)?;
                }
                if forced {
                    if let Some(object) = ctx.change_set().get_mut(object) {
                        object.force_version_bump = true;
                    }
                }
            }
        }

        for object in change_set.iter_mut() {
            if !object.has_changes() || object.should_be_deleted {
                continue;
            }
            if let Some(policy) = descriptors.get(&object.entity).and_then(|d| d.locking()) {
                object.write_lock_value = Some(policy.next_value(object.initial_write_lock_value));
            }
        }
        Ok(change_set)
    }

    fn assign_sequence_numbers(&mut self) -> CoherenceResult<()> {
        let new_objects: Vec<ObjectId> = self.registry.new_objects().collect();
        for id in new_objects {
            let Some(clone) = self.registry.get(id).cloned() else {
                continue;
            };
            let descriptor = self.session.descriptor(clone.entity())?;
            if self.session.sequencing().assign(&descriptor, &clone)? {
                if let Some(key) = clone.with_state(|state| descriptor.cache_key_of(state)) {
                    self.registry.set_key(id, key);
                }
            }
        }
        Ok(())
    }

    /// Compute changes since the last flush and fold them into the
    /// unit of work's change set
    ///
    /// Working copies with changes take their new lock value, and their
    /// backups become their current state.
    pub fn flush(&mut self) -> CoherenceResult<UnitOfWorkChangeSet> {
        self.check_active()?;
        self.assign_sequence_numbers()?;
        let change_set = self.calculate_changes()?;
        let descriptors = Arc::clone(self.session.descriptors());

        for object in change_set.iter() {
            if object.should_be_deleted || !object.has_changes() {
                continue;
            }
            let Some(clone_id) = object.clone_id else {
                continue;
            };
            let Some(clone) = self.registry.get(clone_id).cloned() else {
                continue;
            };
            let policy = descriptors.get(&object.entity).and_then(|d| d.locking());
            if let (Some(policy), Some(value)) = (policy, object.write_lock_value) {
                clone.set(policy.attribute(), value.to_value());
            }
            if let Some(key) = &object.key {
                self.registry.set_key(clone_id, key.clone());
            }
            self.registry.mark_flushed(clone_id, clone.snapshot());
        }

        self.cumulative.merge_from(&change_set);
        debug!(target: "coherence::uow", objects = change_set.len(), "flushed changes");
        Ok(change_set)
    }

    /// Flush, then validate and merge every change into the shared cache
    ///
    /// # Errors
    ///
    /// `OptimisticLock` if an object changed in the cache since it was
    /// read; `ObjectChangedSinceLastMerge` or `Validation` for a new object
    /// that already exists. On error nothing is merged and the unit of work
    /// becomes `Failed`.
    pub fn commit(&mut self) -> CoherenceResult<MergeSummary> {
        self.check_active()?;
        let result = self.flush().and_then(|_| {
            self.session.commit_change_set_with(
                &self.cumulative,
                Some(&self.registry as &dyn ObjectSpace),
                self.suppress_validation,
            )
        });
        match result {
            Ok(summary) => {
                self.cumulative.mark_clean();
                self.status = UnitOfWorkStatus::Committed;
                Ok(summary)
            }
            Err(e) => {
                warn!(target: "coherence::uow", error = %e, "commit failed");
                self.status = UnitOfWorkStatus::Failed;
                Err(e)
            }
        }
    }

    /// Discard every working copy and change
    pub fn release(&mut self) {
        if self.status == UnitOfWorkStatus::Active {
            self.status = UnitOfWorkStatus::Released;
        }
        self.registry = CloneRegistry::new();
        self.cumulative = UnitOfWorkChangeSet::new(self.session.id());
        debug!(target: "coherence::uow", status = %self.status, "released unit of work");
    }

    // ========================================================================
    // Merges into working copies
    // ========================================================================

    /// Discard the working copy's changes, restoring the cached state
    ///
    /// A new object is unregistered and `None` is returned.
    pub fn revert_object(&mut self, clone_id: ObjectId) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.check_active()?;
        self.require_registered(clone_id)?;
        if self.registry.is_new(clone_id) {
            self.registry.unregister(clone_id);
            return Ok(None);
        }
        self.registry.restore(clone_id);
        let original = match self.registry.key_of(clone_id).cloned() {
            Some(key) => self.session.read_original(&key)?,
            None => self
                .registry
                .original_of(clone_id)
                .and_then(|id| self.session.cache().resolve(id)),
        };
        match original {
            Some(original) => self.refresh_from(&original),
            None => Ok(None),
        }
    }

    /// Reload the object from the data source into the cache and the
    /// working copy
    pub fn refresh_object(&mut self, clone_id: ObjectId) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.check_active()?;
        self.require_registered(clone_id)?;
        let Some(key) = self.registry.key_of(clone_id).cloned() else {
            return Ok(self.registry.get(clone_id).cloned());
        };
        match self.session.refresh_original(&key)? {
            Some(original) => self.refresh_from(&original),
            None => Ok(None),
        }
    }

    fn refresh_from(&mut self, original: &Arc<EntityObject>) -> CoherenceResult<Option<Arc<EntityObject>>> {
        let cache = Arc::clone(self.session.cache());
        let space: &dyn ObjectSpace = cache.as_ref();
        let mut merge = MergeManager::new(
            &self.session,
            MergePolicy::RefreshFromOriginal,
            MergeSource::Objects(space),
            MergeTarget::WorkingCopies(&mut self.registry),
        )?
        .with_cascade(CascadePolicy::PrivateParts);
        let merged = merge.merge(Some(original.id()))?;
        merge.finish()?;
        Ok(merged.and_then(|id| self.registry.get(id).cloned()))
    }

    /// Merge a detached object into this unit of work
    ///
    /// Referenced objects are merged as the session's cascade policy says.
    /// Returns the working copy standing for `root`. A read-only type is
    /// returned unchanged.
    ///
    /// # Arguments
    ///
    /// * `detached` - Space holding the detached objects
    /// * `root` - Handle of the object to merge
    pub fn merge_clone(
        &mut self,
        detached: &dyn ObjectSpace,
        root: ObjectId,
    ) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.merge_detached(MergePolicy::CloneToWorkingCopy, detached, root)
    }

    /// Merge a detached object and everything it references
    pub fn merge_clone_with_references(
        &mut self,
        detached: &dyn ObjectSpace,
        root: ObjectId,
    ) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.merge_detached(MergePolicy::CloneWithRefs, detached, root)
    }

    fn merge_detached(
        &mut self,
        policy: MergePolicy,
        detached: &dyn ObjectSpace,
        root: ObjectId,
    ) -> CoherenceResult<Option<Arc<EntityObject>>> {
        self.check_active()?;
        let mut merge = MergeManager::new(
            &self.session,
            policy,
            MergeSource::Objects(detached),
            MergeTarget::WorkingCopies(&mut self.registry),
        )?
        .with_suppress_validation(self.suppress_validation);
        let merged = merge.merge(Some(root))?;
        merge.finish()?;
        // Read-only objects come back unchanged: the shared original or the
        // detached object itself.
        Ok(merged.and_then(|id| {
            self.registry
                .get(id)
                .cloned()
                .or_else(|| self.session.cache().resolve(id))
                .or_else(|| detached.resolve(id))
        }))
    }

    /// Copy the working copy `root` and everything it reaches out of the
    /// unit of work
    ///
    /// Returns the detached graph and the handle of `root`'s copy. The
    /// copies reference each other, never the working copies.
    pub fn detach(&self, root: ObjectId) -> CoherenceResult<(ObjectGraph, ObjectId)> {
        self.check_active()?;
        self.require_registered(root)?;
        let mut copies: FxHashMap<ObjectId, Arc<EntityObject>> = FxHashMap::default();
        let mut order = Vec::new();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if copies.contains_key(&id) {
                continue;
            }
            let Some(clone) = self.registry.get(id).cloned() else {
                continue;
            };
            copies.insert(id, EntityObject::empty(clone.entity().clone()));
            pending.extend(clone.with_state(|state| {
                state
                    .values()
                    .flat_map(Value::referenced_ids)
                    .collect::<Vec<_>>()
            }));
            order.push(clone);
        }

        let mut graph = ObjectGraph::new();
        for clone in order {
            let descriptor = self.session.descriptor(clone.entity())?;
            let state = descriptor.populate_attributes_for_clone(&clone.snapshot(), &mut |id| {
                Ok(copies.get(&id).map(|c| c.id()).unwrap_or(id))
            })?;
            let copy = copies
                .get(&clone.id())
                .cloned()
                .ok_or_else(|| CoherenceError::internal("detached copy missing"))?;
            copy.replace_state(state);
            graph.insert(copy);
        }
        let root_copy = copies
            .get(&root)
            .map(|c| c.id())
            .ok_or_else(|| CoherenceError::internal("detached root missing"))?;
        Ok((graph, root_copy))
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("session", &self.session.id())
            .field("status", &self.status)
            .field("working_copies", &self.registry.len())
            .field("changes", &self.cumulative.len())
            .finish()
    }
}
