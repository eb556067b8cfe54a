//! Change computation context

use coherence_core::{CoherenceError, CoherenceResult, ObjectId, ObjectSpace, ValidationKind};

use crate::changeset::record::ChangeSetId;
use crate::changeset::unit::UnitOfWorkChangeSet;
use crate::descriptor::{CacheSynchronizationType, DescriptorRegistry};
use crate::unit_of_work::CloneRegistry;

/// State shared by mappings while one unit of work computes its changes
///
/// Relationship mappings record references as change-set ids; the context
/// creates the referenced object's change set on first use.
pub struct ChangeContext<'a> {
    change_set: &'a mut UnitOfWorkChangeSet,
    registry: &'a CloneRegistry,
    descriptors: &'a DescriptorRegistry,
    default_sync: CacheSynchronizationType,
}

impl<'a> ChangeContext<'a> {
    /// Context writing into `change_set`
    pub fn new(
        change_set: &'a mut UnitOfWorkChangeSet,
        registry: &'a CloneRegistry,
        descriptors: &'a DescriptorRegistry,
        default_sync: CacheSynchronizationType,
    ) -> Self {
        Self {
            change_set,
            registry,
            descriptors,
            default_sync,
        }
    }

    /// The change set being built
    pub fn change_set(&mut self) -> &mut UnitOfWorkChangeSet {
        &mut *self.change_set
    }

    /// Change set for working copy `clone_id`, created if absent
    ///
    /// A created change set carries the object's key, new flag, initial
    /// lock value and synchronization type, but no records.
    ///
    /// # Errors
    ///
    /// `Validation(ObjectNotRegistered)` if `clone_id` is not a working copy
    /// of this unit of work.
    pub fn change_set_for(&mut self, clone_id: ObjectId) -> CoherenceResult<ChangeSetId> {
        if let Some(id) = self.change_set.find_by_clone(clone_id) {
            return Ok(id);
        }
        let clone = self.registry.resolve(clone_id).ok_or_else(|| {
            CoherenceError::validation(
                ValidationKind::ObjectNotRegistered,
                format!("object {} is referenced but not registered", clone_id),
            )
        })?;
        let descriptor = self.descriptors.describe(clone.entity())?;
        let state = clone.snapshot();
        let is_new = self.registry.is_new(clone_id);
        let initial = descriptor.locking().and_then(|policy| {
            if is_new {
                policy.extract(&state)
            } else {
                self.registry
                    .backup(clone_id)
                    .and_then(|backup| policy.extract(backup))
            }
        });

        let id = self.change_set.create(
            descriptor.entity().clone(),
            descriptor.cache_key_of(&state),
            Some(clone_id),
        );
        if let Some(object) = self.change_set.get_mut(id) {
            object.is_new = is_new;
            object.is_aggregate = descriptor.is_aggregate();
            object.initial_write_lock_value = initial;
            object.write_lock_value = initial;
            object.sync_type = descriptor.sync_type().unwrap_or(self.default_sync);
        }
        Ok(id)
    }

    /// Change set for `clone_id` if it is still registered
    ///
    /// Used for the old side of a reference change, whose target may have
    /// been unregistered since.
    pub fn try_change_set_for(&mut self, clone_id: ObjectId) -> Option<ChangeSetId> {
        if !self.registry.contains(clone_id) {
            return None;
        }
        self.change_set_for(clone_id).ok()
    }
}
