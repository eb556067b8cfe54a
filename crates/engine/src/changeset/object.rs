//! Per-object change sets

use coherence_core::{CacheKey, EntityType, ObjectId, WriteLockValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::changeset::record::{ChangeRecord, ChangeSetId};
use crate::descriptor::CacheSynchronizationType;

/// Changes of one object within a unit of work
///
/// Records are keyed by attribute name, so a second change to the same
/// attribute replaces the first and iteration order is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectChangeSet {
    /// Address in the owning container
    pub id: ChangeSetId,
    /// Entity type
    pub entity: EntityType,
    /// Identity-map key; absent for new objects not yet keyed
    pub key: Option<CacheKey>,
    /// Working copy the changes were computed from
    #[serde(skip)]
    pub clone_id: Option<ObjectId>,
    /// Records by attribute
    pub changes: BTreeMap<String, ChangeRecord>,
    /// Object did not exist before this unit of work
    pub is_new: bool,
    /// Object is to be removed
    pub should_be_deleted: bool,
    /// Object is embedded in an owner
    pub is_aggregate: bool,
    /// Changes must not be merged; the cache entry is invalidated instead
    pub is_invalid: bool,
    /// Write lock value must advance even without attribute changes
    pub force_version_bump: bool,
    /// Lock value the unit of work started from
    pub initial_write_lock_value: Option<WriteLockValue>,
    /// Lock value after the changes are applied
    pub write_lock_value: Option<WriteLockValue>,
    /// What cooperating caches receive for this object
    pub sync_type: CacheSynchronizationType,
}

impl ObjectChangeSet {
    pub(crate) fn new(
        id: ChangeSetId,
        entity: EntityType,
        key: Option<CacheKey>,
        clone_id: Option<ObjectId>,
    ) -> Self {
        Self {
            id,
            entity,
            key,
            clone_id,
            changes: BTreeMap::new(),
            is_new: false,
            should_be_deleted: false,
            is_aggregate: false,
            is_invalid: false,
            force_version_bump: false,
            initial_write_lock_value: None,
            write_lock_value: None,
            sync_type: CacheSynchronizationType::default(),
        }
    }

    /// Check if merging this change set would change anything
    ///
    /// True with at least one record, for a new object, or with a forced
    /// version bump.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty() || self.is_new || self.force_version_bump
    }

    /// Record for `attribute`
    pub fn change(&self, attribute: &str) -> Option<&ChangeRecord> {
        self.changes.get(attribute)
    }

    /// Add or replace the record for its attribute
    pub fn add_change(&mut self, record: ChangeRecord) {
        self.changes.insert(record.attribute.clone(), record);
    }

    /// Change sets referenced from this one's records
    pub fn referenced_change_sets(&self) -> Vec<ChangeSetId> {
        self.changes
            .values()
            .flat_map(ChangeRecord::referenced_change_sets)
            .collect()
    }

    /// Short description used in errors and logs
    pub fn describe(&self) -> String {
        match &self.key {
            Some(key) => key.to_string(),
            None => format!("new {} ({})", self.entity, self.id),
        }
    }
}
