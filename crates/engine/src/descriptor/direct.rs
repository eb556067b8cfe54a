//! Value mappings: basic values and embedded aggregates

use coherence_core::{Attributes, CoherenceError, CoherenceResult, ObjectId, Value};
use std::collections::BTreeMap;

use crate::changeset::{AttributeChange, ChangeContext, ChangeRecord};
use crate::descriptor::mapping::{AttributeMapping, ComparableMapping, MergeableMapping};
use crate::merge::MergeManager;

fn mismatched_record(attribute: &str, record: &ChangeRecord, expected: &str) -> CoherenceError {
    CoherenceError::internal(format!(
        "{} mapping for '{}' received a {:?} record",
        expected, attribute, record.change
    ))
}

fn set_or_remove(target: &mut Attributes, attribute: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            target.insert(attribute.to_string(), value);
        }
        None => {
            target.remove(attribute);
        }
    }
}

/// Basic value mapping compared by value equality
#[derive(Debug, Clone)]
pub struct DirectMapping {
    attribute: String,
    read_only: bool,
}

impl DirectMapping {
    /// Writable mapping for `attribute`
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

impl AttributeMapping for DirectMapping {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn as_comparable(&self) -> Option<&dyn ComparableMapping> {
        Some(self)
    }

    fn as_mergeable(&self) -> Option<&dyn MergeableMapping> {
        Some(self)
    }
}

impl ComparableMapping for DirectMapping {
    fn compare_for_change(
        &self,
        clone: &Attributes,
        backup: &Attributes,
        _ctx: &mut ChangeContext<'_>,
    ) -> CoherenceResult<Option<ChangeRecord>> {
        let new = self.extract_value(clone);
        let old = self.extract_value(backup);
        if new == old {
            return Ok(None);
        }
        Ok(Some(ChangeRecord::direct(self.attribute.clone(), old, new)))
    }
}

impl MergeableMapping for DirectMapping {
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        _is_target_new: bool,
        source: &Attributes,
        _merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        set_or_remove(target, &self.attribute, source.get(&self.attribute).cloned());
        Ok(())
    }

    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        _merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        match &record.change {
            AttributeChange::Direct { new, .. } => {
                target.insert(self.attribute.clone(), new.clone());
                Ok(())
            }
            _ => Err(mismatched_record(&self.attribute, record, "direct")),
        }
    }
}

/// Embedded value mapping
///
/// The value is an `Embedded` map compared by deep equality. Object
/// handles inside it are resolved into the target space on merge.
#[derive(Debug, Clone)]
pub struct AggregateMapping {
    attribute: String,
}

impl AggregateMapping {
    /// Mapping for `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

/// Rebuild `value` with every handle passed through `resolve`
///
/// Unresolved single references become `Null`; unresolved list members are
/// dropped.
fn translate(
    value: &Value,
    resolve: &mut dyn FnMut(ObjectId) -> CoherenceResult<Option<ObjectId>>,
) -> CoherenceResult<Value> {
    Ok(match value {
        Value::Ref(id) => resolve(*id)?.map(Value::Ref).unwrap_or(Value::Null),
        Value::RefList(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(resolved) = resolve(*id)? {
                    out.push(resolved);
                }
            }
            Value::RefList(out)
        }
        Value::Embedded(fields) => {
            let mut out = BTreeMap::new();
            for (name, field) in fields {
                out.insert(name.clone(), translate(field, resolve)?);
            }
            Value::Embedded(out)
        }
        other => other.clone(),
    })
}

impl AttributeMapping for AggregateMapping {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn as_comparable(&self) -> Option<&dyn ComparableMapping> {
        Some(self)
    }

    fn as_mergeable(&self) -> Option<&dyn MergeableMapping> {
        Some(self)
    }
}

impl ComparableMapping for AggregateMapping {
    fn compare_for_change(
        &self,
        clone: &Attributes,
        backup: &Attributes,
        ctx: &mut ChangeContext<'_>,
    ) -> CoherenceResult<Option<ChangeRecord>> {
        let new = self.extract_value(clone);
        let old = self.extract_value(backup);
        if new == old {
            return Ok(None);
        }
        let mut references = BTreeMap::new();
        for id in new.referenced_ids() {
            references.insert(id, ctx.change_set_for(id)?);
        }
        Ok(Some(ChangeRecord {
            attribute: self.attribute.clone(),
            change: AttributeChange::Aggregate {
                old,
                new,
                references,
            },
        }))
    }
}

impl MergeableMapping for AggregateMapping {
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        _is_target_new: bool,
        source: &Attributes,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let Some(value) = source.get(&self.attribute) else {
            target.remove(&self.attribute);
            return Ok(());
        };
        let merged = translate(value, &mut |id| merger.merge_reference(id, self))?;
        target.insert(self.attribute.clone(), merged);
        Ok(())
    }

    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        let AttributeChange::Aggregate {
            new, references, ..
        } = &record.change
        else {
            return Err(mismatched_record(&self.attribute, record, "aggregate"));
        };
        let merged = translate(new, &mut |id| match references.get(&id) {
            Some(change_set) => merger.merge_change_set_reference(*change_set),
            None => Ok(None),
        })?;
        target.insert(self.attribute.clone(), merged);
        Ok(())
    }
}
