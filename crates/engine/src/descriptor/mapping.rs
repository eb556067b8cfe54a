//! Attribute mapping capabilities
//!
//! Every mapping implements [`AttributeMapping`]. What it can do beyond that
//! is discovered through capability queries: a mapping that cannot compute
//! change records returns `None` from [`AttributeMapping::as_comparable`],
//! and so on. Descriptor validation uses these queries to reject
//! configurations that would need a missing capability.

use coherence_core::{Attributes, CoherenceResult, ObjectId, Value};
use std::fmt;

use crate::changeset::{ChangeContext, ChangeRecord};
use crate::merge::MergeManager;

/// Rewrites one object handle while cloning a value
pub type RemapFn<'f> = dyn FnMut(ObjectId) -> CoherenceResult<ObjectId> + 'f;

/// Base trait for all attribute mappings
pub trait AttributeMapping: Send + Sync + fmt::Debug {
    /// Attribute this mapping owns
    fn attribute(&self) -> &str;

    /// Read-only mappings never produce change records and are never written
    fn is_read_only(&self) -> bool {
        false
    }

    /// Referenced objects are owned by the referencing object
    fn is_private_owned(&self) -> bool {
        false
    }

    /// Merges follow this mapping under the by-mapping cascade policy
    fn cascades_merge(&self) -> bool {
        false
    }

    /// Values are object references
    fn is_relationship(&self) -> bool {
        false
    }

    /// Values are lists of object references
    fn is_collection(&self) -> bool {
        false
    }

    /// Change-record capability
    fn as_comparable(&self) -> Option<&dyn ComparableMapping> {
        None
    }

    /// Merge capability
    fn as_mergeable(&self) -> Option<&dyn MergeableMapping> {
        None
    }

    /// Cascade capability
    fn as_cascadable(&self) -> Option<&dyn CascadableMapping> {
        None
    }

    /// Value of this mapping's attribute in `state`, `Null` if unset
    fn extract_value(&self, state: &Attributes) -> Value {
        state.get(self.attribute()).cloned().unwrap_or(Value::Null)
    }

    /// Clone `value` for a new working copy, rewriting object handles
    fn build_clone_value(&self, value: &Value, remap: &mut RemapFn<'_>) -> CoherenceResult<Value> {
        remap_references(value, remap)
    }
}

/// Mappings that can diff a working copy against its backup
pub trait ComparableMapping: AttributeMapping {
    /// Compare clone and backup state for this mapping's attribute
    ///
    /// Returns `None` when the attribute is unchanged. Relationship mappings
    /// use `ctx` to find or create change sets for the referenced objects.
    fn compare_for_change(
        &self,
        clone: &Attributes,
        backup: &Attributes,
        ctx: &mut ChangeContext<'_>,
    ) -> CoherenceResult<Option<ChangeRecord>>;
}

/// Mappings that can merge state into a target object
pub trait MergeableMapping: AttributeMapping {
    /// Merge this attribute of `source` into `target`
    ///
    /// Referenced objects are merged or resolved through `merger`, which
    /// applies the merge's cascade policy and cycle guard.
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        is_target_new: bool,
        source: &Attributes,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()>;

    /// Apply one change record to `target`
    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()>;
}

/// Mappings whose referenced objects can be visited by cascades
pub trait CascadableMapping: AttributeMapping {
    /// Handles referenced from `state` through this mapping
    fn cascade_targets(&self, state: &Attributes) -> Vec<ObjectId> {
        self.extract_value(state).referenced_ids()
    }
}

/// Copy `value`, passing every object handle through `remap`
pub fn remap_references(value: &Value, remap: &mut RemapFn<'_>) -> CoherenceResult<Value> {
    Ok(match value {
        Value::Ref(id) => Value::Ref(remap(*id)?),
        Value::RefList(ids) => Value::RefList(
            ids.iter()
                .map(|id| remap(*id))
                .collect::<CoherenceResult<Vec<_>>>()?,
        ),
        Value::Embedded(fields) => {
            let mut out = Attributes::new();
            for (name, field) in fields {
                out.insert(name.clone(), remap_references(field, remap)?);
            }
            Value::Embedded(out)
        }
        other => other.clone(),
    })
}
