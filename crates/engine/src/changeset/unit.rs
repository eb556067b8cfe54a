//! Transaction-wide change set container

use coherence_core::{CacheKey, CoherenceError, CoherenceResult, EntityType, ObjectId, SessionId};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::warn;

use crate::changeset::object::ObjectChangeSet;
use crate::changeset::record::{ChangeRecord, ChangeSetId};
use crate::descriptor::CacheSynchronizationType;

/// All object change sets of one unit of work
///
/// Object change sets live in an arena addressed by [`ChangeSetId`], with
/// indexes by working-copy handle and by cache key. Iteration follows id
/// order, which is creation order.
#[derive(Debug, Clone)]
pub struct UnitOfWorkChangeSet {
    pub(crate) origin: SessionId,
    pub(crate) objects: Vec<ObjectChangeSet>,
    pub(crate) by_clone: FxHashMap<ObjectId, ChangeSetId>,
    pub(crate) by_key: BTreeMap<CacheKey, ChangeSetId>,
    dirty: bool,
}

impl UnitOfWorkChangeSet {
    /// Empty container for changes made in session `origin`
    pub fn new(origin: SessionId) -> Self {
        Self {
            origin,
            objects: Vec::new(),
            by_clone: FxHashMap::default(),
            by_key: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Session the changes were made in
    pub fn origin(&self) -> SessionId {
        self.origin
    }

    /// Add an empty object change set
    pub fn create(
        &mut self,
        entity: EntityType,
        key: Option<CacheKey>,
        clone_id: Option<ObjectId>,
    ) -> ChangeSetId {
        let id = ChangeSetId::from_index(self.objects.len());
        if let Some(key) = &key {
            self.by_key.insert(key.clone(), id);
        }
        if let Some(clone_id) = clone_id {
            self.by_clone.insert(clone_id, id);
        }
        self.objects
            .push(ObjectChangeSet::new(id, entity, key, clone_id));
        self.dirty = true;
        id
    }

    /// Object change set by id
    pub fn get(&self, id: ChangeSetId) -> Option<&ObjectChangeSet> {
        self.objects.get(id.index())
    }

    /// Mutable object change set by id
    ///
    /// Key and working-copy indexes are not updated; use the container's
    /// own methods to change an object's key.
    pub fn get_mut(&mut self, id: ChangeSetId) -> Option<&mut ObjectChangeSet> {
        self.objects.get_mut(id.index())
    }

    /// Change set computed from working copy `clone_id`
    pub fn find_by_clone(&self, clone_id: ObjectId) -> Option<ChangeSetId> {
        self.by_clone.get(&clone_id).copied()
    }

    /// Change set for cache key `key`
    pub fn find_by_key(&self, key: &CacheKey) -> Option<ChangeSetId> {
        self.by_key.get(key).copied()
    }

    /// Add or replace a record and mark the container dirty
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `id` is not in this container.
    pub fn record_change(&mut self, id: ChangeSetId, record: ChangeRecord) -> CoherenceResult<()> {
        let object = self
            .objects
            .get_mut(id.index())
            .ok_or_else(|| CoherenceError::invalid_input(format!("unknown change set {}", id)))?;
        object.add_change(record);
        self.dirty = true;
        Ok(())
    }

    /// Set the cache key of a change set whose object gained one
    pub(crate) fn set_key(&mut self, id: ChangeSetId, key: CacheKey) {
        if let Some(object) = self.objects.get_mut(id.index()) {
            if let Some(old) = object.key.replace(key.clone()) {
                self.by_key.remove(&old);
            }
            self.by_key.insert(key, id);
        }
    }

    /// Object change sets in id order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectChangeSet> {
        self.objects.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ObjectChangeSet> {
        self.objects.iter_mut()
    }

    /// Number of object change sets
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the container is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Check if any object change set has changes or is a deletion
    pub fn has_changes(&self) -> bool {
        self.objects
            .iter()
            .any(|o| o.has_changes() || o.should_be_deleted)
    }

    /// Ids of new objects
    pub fn new_objects(&self) -> Vec<ChangeSetId> {
        self.objects.iter().filter(|o| o.is_new).map(|o| o.id).collect()
    }

    /// Ids of objects to delete
    pub fn deleted_objects(&self) -> Vec<ChangeSetId> {
        self.objects
            .iter()
            .filter(|o| o.should_be_deleted)
            .map(|o| o.id)
            .collect()
    }

    /// Check if the container changed since it was last marked clean
    ///
    /// A unit of work marks its cumulative change set clean once it has been
    /// merged into the shared cache.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn find_match(&self, incoming: &ObjectChangeSet) -> Option<ChangeSetId> {
        incoming
            .clone_id
            .and_then(|c| self.find_by_clone(c))
            .or_else(|| incoming.key.as_ref().and_then(|k| self.find_by_key(k)))
    }

    /// Fold a later change set of the same unit of work into this one
    ///
    /// Object change sets are matched by working copy, then by key. For a
    /// match, the incoming initial lock value must equal the existing
    /// current value; otherwise something changed the object between the
    /// two computations and the merged change set is marked invalid.
    /// Records are adopted or merged (later value wins) with their
    /// change-set references re-targeted into this container.
    pub fn merge_from(&mut self, incoming: &UnitOfWorkChangeSet) {
        let mut id_map = FxHashMap::default();
        for object in &incoming.objects {
            let target = match self.find_match(object) {
                Some(id) => id,
                None => {
                    let id = self.create(object.entity.clone(), object.key.clone(), object.clone_id);
                    let created = &mut self.objects[id.index()];
                    created.is_new = object.is_new;
                    created.is_aggregate = object.is_aggregate;
                    created.sync_type = object.sync_type;
                    created.initial_write_lock_value = object.initial_write_lock_value;
                    created.write_lock_value = object.initial_write_lock_value;
                    id
                }
            };
            id_map.insert(object.id, target);
        }

        let mut rekeyed = Vec::new();
        for object in &incoming.objects {
            let target_id = id_map[&object.id];
            let target = &mut self.objects[target_id.index()];

            if target.write_lock_value != object.initial_write_lock_value {
                warn!(
                    target: "coherence::uow",
                    object = %object.describe(),
                    "lock value changed between change set computations, marking invalid"
                );
                target.is_invalid = true;
            }

            for record in object.changes.values() {
                let mut record = record.clone();
                record.retarget(&id_map);
                match target.changes.get_mut(&record.attribute) {
                    Some(existing) => existing.merge(&record),
                    None => {
                        target.changes.insert(record.attribute.clone(), record);
                    }
                }
            }

            target.is_new |= object.is_new;
            target.is_invalid |= object.is_invalid;
            target.force_version_bump |= object.force_version_bump;
            target.should_be_deleted = object.should_be_deleted;
            target.write_lock_value = object.write_lock_value;
            if object.key.is_some() && target.key != object.key {
                rekeyed.extend(object.key.clone().map(|k| (target_id, k)));
            }
        }
        for (id, key) in rekeyed {
            self.set_key(id, key);
        }
        self.dirty = true;
    }

    /// Change set to ship to cooperating caches
    ///
    /// Working-copy handles are dropped. Each object is included according
    /// to its synchronization type: `DoNotSend` objects are skipped,
    /// `InvalidateChangedObjects` objects become bare invalidation markers,
    /// and new objects are only sent under `SendNewObjectsWithChanges`.
    /// Objects referenced from an included record but not included
    /// themselves are added as change-free stubs carrying only their key.
    pub fn for_distribution(&self) -> UnitOfWorkChangeSet {
        let mut out = UnitOfWorkChangeSet::new(self.origin);
        let mut id_map = FxHashMap::default();

        for object in &self.objects {
            if object.is_aggregate || object.key.is_none() {
                continue;
            }
            if !object.has_changes() && !object.should_be_deleted {
                continue;
            }
            let include = match object.sync_type {
                CacheSynchronizationType::DoNotSend => false,
                CacheSynchronizationType::SendObjectChanges => !object.is_new,
                CacheSynchronizationType::InvalidateChangedObjects
                | CacheSynchronizationType::SendNewObjectsWithChanges => true,
            };
            if !include {
                continue;
            }
            let id = out.create(object.entity.clone(), object.key.clone(), None);
            let copy = &mut out.objects[id.index()];
            copy.sync_type = object.sync_type;
            copy.should_be_deleted = object.should_be_deleted;
            copy.initial_write_lock_value = object.initial_write_lock_value;
            copy.write_lock_value = object.write_lock_value;
            copy.force_version_bump = object.force_version_bump;
            if object.sync_type != CacheSynchronizationType::InvalidateChangedObjects {
                copy.changes = object.changes.clone();
                copy.is_new = object.is_new;
            }
            id_map.insert(object.id, id);
        }

        let referenced: Vec<ChangeSetId> = out
            .objects
            .iter()
            .flat_map(ObjectChangeSet::referenced_change_sets)
            .collect();
        for source_id in referenced {
            if id_map.contains_key(&source_id) {
                continue;
            }
            let Some(source) = self.get(source_id) else {
                continue;
            };
            if let Some(key) = source.key.clone() {
                let stub = out.create(source.entity.clone(), Some(key), None);
                id_map.insert(source_id, stub);
            }
        }

        for object in &mut out.objects {
            let dangling = object
                .referenced_change_sets()
                .iter()
                .any(|r| !id_map.contains_key(r));
            if dangling {
                // A referenced object has no key to send; peers invalidate instead.
                object.changes.clear();
                object.is_new = false;
                object.sync_type = CacheSynchronizationType::InvalidateChangedObjects;
                continue;
            }
            for record in object.changes.values_mut() {
                record.retarget(&id_map);
            }
        }
        out.dirty = false;
        out
    }

    pub(crate) fn from_parts(origin: SessionId, objects: Vec<ObjectChangeSet>) -> Self {
        let mut by_key = BTreeMap::new();
        for object in &objects {
            if let Some(key) = &object.key {
                by_key.insert(key.clone(), object.id);
            }
        }
        Self {
            origin,
            objects,
            by_clone: FxHashMap::default(),
            by_key,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::record::AttributeChange;
    use coherence_core::{PrimaryKey, Value, WriteLockValue};

    fn key(id: i64) -> CacheKey {
        CacheKey::new("Employee", PrimaryKey::int(id))
    }

    fn single(
        initial: u64,
        record: ChangeRecord,
    ) -> (UnitOfWorkChangeSet, ChangeSetId) {
        let mut uow = UnitOfWorkChangeSet::new(SessionId::new());
        let id = uow.create(EntityType::new("Employee"), Some(key(1)), None);
        let object = uow.get_mut(id).unwrap();
        object.initial_write_lock_value = Some(WriteLockValue::Version(initial));
        object.write_lock_value = Some(WriteLockValue::Version(initial + 1));
        uow.record_change(id, record).unwrap();
        (uow, id)
    }

    #[test]
    fn test_indexes() {
        let mut uow = UnitOfWorkChangeSet::new(SessionId::new());
        let clone = ObjectId::next();
        let id = uow.create(EntityType::new("Employee"), Some(key(1)), Some(clone));
        assert_eq!(uow.find_by_clone(clone), Some(id));
        assert_eq!(uow.find_by_key(&key(1)), Some(id));
        assert!(uow.is_dirty());
        assert!(!uow.has_changes());
    }

    #[test]
    fn test_mark_clean_until_next_merge() {
        let (mut a, _) = single(1, ChangeRecord::direct("name", Value::from("x"), Value::from("y")));
        let (b, _) = single(2, ChangeRecord::direct("name", Value::from("y"), Value::from("z")));
        a.mark_clean();
        assert!(!a.is_dirty());
        a.merge_from(&b);
        assert!(a.is_dirty());
    }

    #[test]
    fn test_merge_from_later_value_wins() {
        let (mut a, a_id) = single(1, ChangeRecord::direct("name", Value::from("x"), Value::from("y")));
        let (b, _) = single(2, ChangeRecord::direct("name", Value::from("y"), Value::from("z")));

        a.merge_from(&b);

        let merged = a.get(a_id).unwrap();
        assert_eq!(merged.changes.len(), 1);
        assert_eq!(merged.change("name").unwrap().new_value(), Some(&Value::from("z")));
        assert!(!merged.is_invalid);
        assert_eq!(merged.write_lock_value, Some(WriteLockValue::Version(3)));
        assert_eq!(merged.initial_write_lock_value, Some(WriteLockValue::Version(1)));
    }

    #[test]
    fn test_merge_from_version_gap_marks_invalid() {
        let (mut a, a_id) = single(1, ChangeRecord::direct("name", Value::from("x"), Value::from("y")));
        let (b, _) = single(5, ChangeRecord::direct("name", Value::from("y"), Value::from("z")));
        a.merge_from(&b);
        assert!(a.get(a_id).unwrap().is_invalid);
    }

    #[test]
    fn test_merge_from_retargets_references() {
        let mut a = UnitOfWorkChangeSet::new(SessionId::new());
        a.create(EntityType::new("Dept"), Some(CacheKey::new("Dept", PrimaryKey::int(9))), None);

        let mut b = UnitOfWorkChangeSet::new(SessionId::new());
        let emp = b.create(EntityType::new("Employee"), Some(key(1)), None);
        let dept = b.create(EntityType::new("Dept"), Some(CacheKey::new("Dept", PrimaryKey::int(9))), None);
        b.record_change(
            emp,
            ChangeRecord {
                attribute: "dept".into(),
                change: AttributeChange::Reference { old: None, new: Some(dept) },
            },
        )
        .unwrap();

        a.merge_from(&b);
        let emp_in_a = a.find_by_key(&key(1)).unwrap();
        let record = a.get(emp_in_a).unwrap().change("dept").unwrap();
        assert_eq!(
            record.change,
            AttributeChange::Reference {
                old: None,
                new: Some(ChangeSetId::from_index(0))
            }
        );
    }

    #[test]
    fn test_for_distribution_applies_sync_types() {
        let mut uow = UnitOfWorkChangeSet::new(SessionId::new());
        let changed = uow.create(EntityType::new("Employee"), Some(key(1)), Some(ObjectId::next()));
        uow.record_change(changed, ChangeRecord::direct("salary", Value::Int(1), Value::Int(2)))
            .unwrap();

        let new_obj = uow.create(EntityType::new("Employee"), Some(key(2)), None);
        uow.get_mut(new_obj).unwrap().is_new = true;

        let hidden = uow.create(EntityType::new("Employee"), Some(key(3)), None);
        uow.record_change(hidden, ChangeRecord::direct("salary", Value::Int(1), Value::Int(2)))
            .unwrap();
        uow.get_mut(hidden).unwrap().sync_type = CacheSynchronizationType::DoNotSend;

        let marker = uow.create(EntityType::new("Employee"), Some(key(4)), None);
        uow.record_change(marker, ChangeRecord::direct("salary", Value::Int(1), Value::Int(2)))
            .unwrap();
        uow.get_mut(marker).unwrap().sync_type = CacheSynchronizationType::InvalidateChangedObjects;

        let out = uow.for_distribution();
        let keys: Vec<_> = out.iter().map(|o| o.key.clone().unwrap()).collect();
        assert_eq!(keys, vec![key(1), key(4)]);
        assert!(out.iter().all(|o| o.clone_id.is_none()));
        let marker_out = out.get(out.find_by_key(&key(4)).unwrap()).unwrap();
        assert!(marker_out.changes.is_empty());
    }

    #[test]
    fn test_for_distribution_adds_stubs_for_references() {
        let mut uow = UnitOfWorkChangeSet::new(SessionId::new());
        let emp = uow.create(EntityType::new("Employee"), Some(key(1)), None);
        let dept_key = CacheKey::new("Dept", PrimaryKey::int(3));
        let dept = uow.create(EntityType::new("Dept"), Some(dept_key.clone()), None);
        uow.record_change(
            emp,
            ChangeRecord {
                attribute: "dept".into(),
                change: AttributeChange::Reference { old: None, new: Some(dept) },
            },
        )
        .unwrap();

        let out = uow.for_distribution();
        assert_eq!(out.len(), 2);
        let stub = out.get(out.find_by_key(&dept_key).unwrap()).unwrap();
        assert!(!stub.has_changes());
    }
}
