//! Attribute change records

use coherence_core::{ObjectId, Value};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Address of an object change set inside a [`UnitOfWorkChangeSet`]
///
/// [`UnitOfWorkChangeSet`]: crate::changeset::UnitOfWorkChangeSet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId(u32);

impl ChangeSetId {
    pub(crate) fn from_index(index: usize) -> Self {
        ChangeSetId(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

/// What changed in one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeChange {
    /// Basic value replaced
    Direct {
        /// Backup value
        old: Value,
        /// Working-copy value
        new: Value,
    },
    /// Embedded value replaced
    ///
    /// Handles inside the embedded value belong to the source space;
    /// `references` translates each into the change set of the object it
    /// names.
    Aggregate {
        /// Backup value
        old: Value,
        /// Working-copy value
        new: Value,
        /// Source handle → change set of the referenced object
        references: BTreeMap<ObjectId, ChangeSetId>,
    },
    /// Single reference retargeted
    Reference {
        /// Change set of the previously referenced object
        old: Option<ChangeSetId>,
        /// Change set of the newly referenced object
        new: Option<ChangeSetId>,
    },
    /// Reference collection changed
    Collection {
        /// Previous members
        old: Vec<ChangeSetId>,
        /// Current members, in order
        new: Vec<ChangeSetId>,
    },
}

/// One attribute's change within an object change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Attribute name
    pub attribute: String,
    /// The change
    pub change: AttributeChange,
}

impl ChangeRecord {
    /// Basic value change
    pub fn direct(attribute: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            attribute: attribute.into(),
            change: AttributeChange::Direct { old, new },
        }
    }

    /// New value of a basic change
    pub fn new_value(&self) -> Option<&Value> {
        match &self.change {
            AttributeChange::Direct { new, .. } | AttributeChange::Aggregate { new, .. } => {
                Some(new)
            }
            _ => None,
        }
    }

    /// Members added by a collection change
    pub fn added(&self) -> Vec<ChangeSetId> {
        match &self.change {
            AttributeChange::Collection { old, new } => {
                new.iter().filter(|id| !old.contains(id)).copied().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Members removed by a collection change
    pub fn removed(&self) -> Vec<ChangeSetId> {
        match &self.change {
            AttributeChange::Collection { old, new } => {
                old.iter().filter(|id| !new.contains(id)).copied().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Change sets this record points at
    pub fn referenced_change_sets(&self) -> Vec<ChangeSetId> {
        match &self.change {
            AttributeChange::Direct { .. } => Vec::new(),
            AttributeChange::Aggregate { references, .. } => references.values().copied().collect(),
            AttributeChange::Reference { old, new } => old.iter().chain(new.iter()).copied().collect(),
            AttributeChange::Collection { old, new } => old.iter().chain(new.iter()).copied().collect(),
        }
    }

    /// Fold a later change of the same attribute into this one
    ///
    /// The later value wins and the earliest old value is kept. A later
    /// change of a different kind replaces this one outright.
    pub fn merge(&mut self, later: &ChangeRecord) {
        match (&mut self.change, &later.change) {
            (AttributeChange::Direct { new, .. }, AttributeChange::Direct { new: later_new, .. }) => {
                *new = later_new.clone();
            }
            (
                AttributeChange::Aggregate {
                    new, references, ..
                },
                AttributeChange::Aggregate {
                    new: later_new,
                    references: later_refs,
                    ..
                },
            ) => {
                *new = later_new.clone();
                *references = later_refs.clone();
            }
            (
                AttributeChange::Reference { new, .. },
                AttributeChange::Reference { new: later_new, .. },
            ) => {
                *new = *later_new;
            }
            (
                AttributeChange::Collection { new, .. },
                AttributeChange::Collection { new: later_new, .. },
            ) => {
                *new = later_new.clone();
            }
            (this, other) => *this = other.clone(),
        }
    }

    /// Rewrite change-set references through `map`
    ///
    /// Ids missing from `map` are left unchanged.
    pub fn retarget(&mut self, map: &FxHashMap<ChangeSetId, ChangeSetId>) {
        let remap = |id: &mut ChangeSetId| {
            if let Some(target) = map.get(id) {
                *id = *target;
            }
        };
        match &mut self.change {
            AttributeChange::Direct { .. } => {}
            AttributeChange::Aggregate { references, .. } => references.values_mut().for_each(remap),
            AttributeChange::Reference { old, new } => {
                old.iter_mut().for_each(remap);
                new.iter_mut().for_each(remap);
            }
            AttributeChange::Collection { old, new } => {
                old.iter_mut().for_each(remap);
                new.iter_mut().for_each(remap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(i: usize) -> ChangeSetId {
        ChangeSetId::from_index(i)
    }

    #[test]
    fn test_merge_keeps_first_old_and_last_new() {
        let mut a = ChangeRecord::direct("name", Value::from("x"), Value::from("y"));
        let b = ChangeRecord::direct("name", Value::from("y"), Value::from("z"));
        a.merge(&b);
        assert_eq!(
            a.change,
            AttributeChange::Direct {
                old: Value::from("x"),
                new: Value::from("z")
            }
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_folding_a_chain_spans_first_to_last(values in proptest::collection::vec(-100i64..100, 2..8)) {
            let mut folded = ChangeRecord::direct("n", Value::Int(values[0]), Value::Int(values[1]));
            for pair in values[1..].windows(2) {
                folded.merge(&ChangeRecord::direct("n", Value::Int(pair[0]), Value::Int(pair[1])));
            }
            let last = *values.last().unwrap();
            proptest::prop_assert_eq!(
                folded.change,
                AttributeChange::Direct { old: Value::Int(values[0]), new: Value::Int(last) }
            );
        }
    }

    #[test]
    fn test_merge_of_different_kind_replaces() {
        let mut a = ChangeRecord::direct("owner", Value::Null, Value::Int(1));
        let b = ChangeRecord {
            attribute: "owner".into(),
            change: AttributeChange::Reference {
                old: None,
                new: Some(cs(3)),
            },
        };
        a.merge(&b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_collection_added_removed() {
        let record = ChangeRecord {
            attribute: "phones".into(),
            change: AttributeChange::Collection {
                old: vec![cs(1), cs(2)],
                new: vec![cs(2), cs(3)],
            },
        };
        assert_eq!(record.added(), vec![cs(3)]);
        assert_eq!(record.removed(), vec![cs(1)]);
    }

    #[test]
    fn test_retarget_maps_known_ids() {
        let mut record = ChangeRecord {
            attribute: "manager".into(),
            change: AttributeChange::Reference {
                old: Some(cs(0)),
                new: Some(cs(1)),
            },
        };
        let mut map = FxHashMap::default();
        map.insert(cs(1), cs(7));
        record.retarget(&map);
        assert_eq!(record.referenced_change_sets(), vec![cs(0), cs(7)]);
    }
}
