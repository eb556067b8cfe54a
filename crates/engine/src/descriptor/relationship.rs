//! Relationship mappings
//!
//! References are compared by identity: a reference attribute changed when
//! it names a different object handle, never because the referenced
//! object's state changed.

use coherence_core::{Attributes, CoherenceError, CoherenceResult, ObjectId, Value};

use crate::changeset::{AttributeChange, ChangeContext, ChangeRecord};
use crate::descriptor::mapping::{
    AttributeMapping, CascadableMapping, ComparableMapping, MergeableMapping,
};
use crate::merge::MergeManager;

fn mismatched(attribute: &str, record: &ChangeRecord) -> CoherenceError {
    CoherenceError::internal(format!(
        "relationship mapping for '{}' received a {:?} record",
        attribute, record.change
    ))
}

/// Single-valued reference
#[derive(Debug, Clone)]
pub struct ReferenceMapping {
    attribute: String,
    private_owned: bool,
    cascade_merge: bool,
}

impl ReferenceMapping {
    /// Reference mapping for `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            private_owned: false,
            cascade_merge: false,
        }
    }

    /// The referenced object is owned by the referencing one
    pub fn private_owned(mut self) -> Self {
        self.private_owned = true;
        self
    }

    /// Merges follow this reference under the by-mapping cascade policy
    pub fn cascade_merge(mut self) -> Self {
        self.cascade_merge = true;
        self
    }
}

impl AttributeMapping for ReferenceMapping {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn is_private_owned(&self) -> bool {
        self.private_owned
    }

    fn cascades_merge(&self) -> bool {
        self.cascade_merge
    }

    fn is_relationship(&self) -> bool {
        true
    }

    fn as_comparable(&self) -> Option<&dyn ComparableMapping> {
        Some(self)
    }

    fn as_mergeable(&self) -> Option<&dyn MergeableMapping> {
        Some(self)
    }

    fn as_cascadable(&self) -> Option<&dyn CascadableMapping> {
        Some(self)
    }
}

impl ComparableMapping for ReferenceMapping {
    fn compare_for_change(
        &self,
        clone: &Attributes,
        backup: &Attributes,
        ctx: &mut ChangeContext<'_>,
    ) -> CoherenceResult<Option<ChangeRecord>> {
        let new = self.extract_value(clone).as_ref_id();
        let old = self.extract_value(backup).as_ref_id();
        if new == old {
            return Ok(None);
        }
        let old = old.and_then(|id| ctx.try_change_set_for(id));
        let new = new.map(|id| ctx.change_set_for(id)).transpose()?;
        Ok(Some(ChangeRecord {
            attribute: self.attribute.clone(),
            change: AttributeChange::Reference { old, new },
        }))
    }
}

impl MergeableMapping for ReferenceMapping {
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        _is_target_new: bool,
        source: &Attributes,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let merged = match self.extract_value(source).as_ref_id() {
            Some(id) => merger.merge_reference(id, self)?,
            None => None,
        };
        target.insert(
            self.attribute.clone(),
            merged.map(Value::Ref).unwrap_or(Value::Null),
        );
        Ok(())
    }

    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let AttributeChange::Reference { new, .. } = &record.change else {
            return Err(mismatched(&self.attribute, record));
        };
        let merged = match new {
            Some(change_set) => merger.merge_change_set_reference(*change_set)?,
            None => None,
        };
        target.insert(
            self.attribute.clone(),
            merged.map(Value::Ref).unwrap_or(Value::Null),
        );
        Ok(())
    }
}

impl CascadableMapping for ReferenceMapping {}

/// Ordered collection of references
#[derive(Debug, Clone)]
pub struct CollectionMapping {
    attribute: String,
    private_owned: bool,
    cascade_merge: bool,
}

impl CollectionMapping {
    /// Collection mapping for `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            private_owned: false,
            cascade_merge: false,
        }
    }

    /// Members are owned by the referencing object
    pub fn private_owned(mut self) -> Self {
        self.private_owned = true;
        self
    }

    /// Merges follow this collection under the by-mapping cascade policy
    pub fn cascade_merge(mut self) -> Self {
        self.cascade_merge = true;
        self
    }

    fn members(&self, state: &Attributes) -> Vec<ObjectId> {
        self.extract_value(state)
            .as_ref_list()
            .map(<[ObjectId]>::to_vec)
            .unwrap_or_default()
    }
}

impl AttributeMapping for CollectionMapping {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn is_private_owned(&self) -> bool {
        self.private_owned
    }

    fn cascades_merge(&self) -> bool {
        self.cascade_merge
    }

    fn is_relationship(&self) -> bool {
        true
    }

    fn is_collection(&self) -> bool {
        true
    }

    fn as_comparable(&self) -> Option<&dyn ComparableMapping> {
        Some(self)
    }

    fn as_mergeable(&self) -> Option<&dyn MergeableMapping> {
        Some(self)
    }

    fn as_cascadable(&self) -> Option<&dyn CascadableMapping> {
        Some(self)
    }
}

impl ComparableMapping for CollectionMapping {
    fn compare_for_change(
        &self,
        clone: &Attributes,
        backup: &Attributes,
        ctx: &mut ChangeContext<'_>,
    ) -> CoherenceResult<Option<ChangeRecord>> {
        let new = self.members(clone);
        let old = self.members(backup);
        if new == old {
            return Ok(None);
        }
        let old = old
            .into_iter()
            .filter_map(|id| ctx.try_change_set_for(id))
            .collect();
        let new = new
            .into_iter()
            .map(|id| ctx.change_set_for(id))
            .collect::<CoherenceResult<Vec<_>>>()?;
        Ok(Some(ChangeRecord {
            attribute: self.attribute.clone(),
            change: AttributeChange::Collection { old, new },
        }))
    }
}

impl MergeableMapping for CollectionMapping {
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        _is_target_new: bool,
        source: &Attributes,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let mut merged = Vec::new();
        for id in self.members(source) {
            if let Some(resolved) = merger.merge_reference(id, self)? {
                merged.push(resolved);
            }
        }
        target.insert(self.attribute.clone(), Value::RefList(merged));
        Ok(())
    }

    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let AttributeChange::Collection { new, .. } = &record.change else {
            return Err(mismatched(&self.attribute, record));
        };
        let mut merged = Vec::with_capacity(new.len());
        for change_set in new {
            if let Some(resolved) = merger.merge_change_set_reference(*change_set)? {
                merged.push(resolved);
            }
        }
        target.insert(self.attribute.clone(), Value::RefList(merged));
        Ok(())
    }
}

impl CascadableMapping for CollectionMapping {}

/// Collection whose members may be of different entity types
///
/// Only cascades: it never computes change records or merges state, so a
/// descriptor accepts it only when it is read-only.
#[derive(Debug, Clone)]
pub struct HeterogeneousCollectionMapping {
    attribute: String,
    read_only: bool,
}

impl HeterogeneousCollectionMapping {
    /// Mapping for `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            read_only: false,
        }
    }

    /// Make the mapping read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl AttributeMapping for HeterogeneousCollectionMapping {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_relationship(&self) -> bool {
        true
    }

    fn is_collection(&self) -> bool {
        true
    }

    fn cascades_merge(&self) -> bool {
        true
    }

    fn as_cascadable(&self) -> Option<&dyn CascadableMapping> {
        Some(self)
    }
}

impl CascadableMapping for HeterogeneousCollectionMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_targets_follow_value() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        let mapping = CollectionMapping::new("phones").private_owned();
        let mut state = Attributes::new();
        state.insert("phones".into(), Value::RefList(vec![a, b]));
        assert_eq!(mapping.cascade_targets(&state), vec![a, b]);
        assert!(mapping.is_private_owned());
    }

    #[test]
    fn test_heterogeneous_collection_only_cascades() {
        let mapping = HeterogeneousCollectionMapping::new("members");
        assert!(mapping.as_comparable().is_none());
        assert!(mapping.as_mergeable().is_none());
        assert!(mapping.as_cascadable().is_some());
    }

    #[test]
    fn test_reference_flags() {
        let mapping = ReferenceMapping::new("address").private_owned().cascade_merge();
        assert!(mapping.is_private_owned());
        assert!(mapping.cascades_merge());
        assert!(!mapping.is_collection());
    }
}
