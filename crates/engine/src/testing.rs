//! Test doubles for merge and unit-of-work tests
//!
//! - [`StaticDataSource`]: in-memory rows with a read counter
//! - [`FailingMapping`]: direct mapping that fails after a number of merges,
//!   for checking that a failed merge still releases every permit
//! - [`RecordingListener`]: merge listener that records the events it sees
//!
//! # Example
//!
//! ```ignore
//! use coherence_engine::testing::{FailingMapping, StaticDataSource};
//!
//! let rows = Arc::new(StaticDataSource::new());
//! rows.insert("Employee", PrimaryKey::int(1), Row::new(state));
//!
//! let descriptor = EntityDescriptor::builder("Employee")
//!     .primary_key(["id"])
//!     .direct("id")
//!     .mapping(Arc::new(FailingMapping::after("salary", 3)))
//!     .build()?;
//! ```

use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, DataSource, EntityObject, EntityType,
    PrimaryKey, Row,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::changeset::{AttributeChange, ChangeContext, ChangeRecord, UnitOfWorkChangeSet};
use crate::descriptor::{AttributeMapping, ComparableMapping, MergeableMapping};
use crate::events::MergeListener;
use crate::merge::{MergeManager, MergePolicy, MergeSummary};

// ============================================================================
// Data source
// ============================================================================

/// Rows held in memory
#[derive(Debug, Default)]
pub struct StaticDataSource {
    rows: RwLock<BTreeMap<CacheKey, Row>>,
    reads: AtomicU64,
}

impl StaticDataSource {
    /// No rows
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the row for `entity` and `key`
    pub fn insert(&self, entity: impl Into<EntityType>, key: PrimaryKey, row: Row) {
        self.rows.write().insert(CacheKey::new(entity, key), row);
    }

    /// Drop a row
    pub fn remove(&self, entity: impl Into<EntityType>, key: PrimaryKey) -> Option<Row> {
        self.rows.write().remove(&CacheKey::new(entity, key))
    }

    /// Number of `read_row` calls so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl DataSource for StaticDataSource {
    fn read_row(&self, entity: &EntityType, key: &PrimaryKey) -> CoherenceResult<Option<Row>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let lookup = CacheKey::new(entity.clone(), key.clone());
        Ok(self.rows.read().get(&lookup).cloned())
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// Direct mapping whose merges fail once a budget is spent
///
/// The first `budget` merges through this mapping succeed; every later
/// merge returns an internal error.
#[derive(Debug)]
pub struct FailingMapping {
    attribute: String,
    budget: usize,
    merges: AtomicUsize,
}

impl FailingMapping {
    /// Mapping for `attribute` failing after `budget` merges
    pub fn after(attribute: impl Into<String>, budget: usize) -> Self {
        Self {
            attribute: attribute.into(),
            budget,
            merges: AtomicUsize::new(0),
        }
    }

    /// Mapping for `attribute` failing on its first merge
    pub fn always(attribute: impl Into<String>) -> Self {
        Self::after(attribute, 0)
    }

    /// Merges attempted so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.merges.load(Ordering::Relaxed)
    }

    fn spend(&self) -> CoherenceResult<()> {
        let attempt = self.merges.fetch_add(1, Ordering::Relaxed);
        if attempt >= self.budget {
            return Err(CoherenceError::internal(format!(
                "injected failure merging '{}'",
                self.attribute
            )));
        }
        Ok(())
    }
}

impl AttributeMapping for FailingMapping {
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

impl ComparableMapping for FailingMapping {
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

impl MergeableMapping for FailingMapping {
    fn merge_into_object(
        &self,
        target: &mut Attributes,
        _is_target_new: bool,
        source: &Attributes,
        _merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        self.spend()?;
        if let Some(value) = source.get(&self.attribute) {
            target.insert(self.attribute.clone(), value.clone());
        }
        Ok(())
    }

    fn merge_changes_into_object(
        &self,
        target: &mut Attributes,
        record: &ChangeRecord,
        _merger: &mut MergeManager<'_>,
    ) -> CoherenceResult<()> {
        self.spend()?;
        match &record.change {
            AttributeChange::Direct { new, .. } => {
                target.insert(self.attribute.clone(), new.clone());
                Ok(())
            }
            other => Err(CoherenceError::internal(format!(
                "failing mapping received a {:?} record",
                other
            ))),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// One observed merge event
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    /// A peer change set is about to be applied
    PreDistributed {
        /// Number of object change sets
        objects: usize,
    },
    /// A peer change set was applied
    PostDistributed(MergeSummary),
    /// One object was merged into the cache
    PostMerge {
        /// Policy of the merge
        policy: MergePolicy,
        /// Entry the object was merged into
        key: CacheKey,
    },
    /// A commit finished
    PostCommit(MergeSummary),
}

/// Merge listener that keeps every event
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Keys merged into the cache, in merge order
    pub fn merged_keys(&self) -> Vec<CacheKey> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::PostMerge { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget every recorded event
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl MergeListener for RecordingListener {
    fn pre_distributed_merge(&self, change_set: &UnitOfWorkChangeSet) {
        self.events.lock().push(RecordedEvent::PreDistributed {
            objects: change_set.len(),
        });
    }

    fn post_distributed_merge(&self, _change_set: &UnitOfWorkChangeSet, summary: &MergeSummary) {
        self.events
            .lock()
            .push(RecordedEvent::PostDistributed(summary.clone()));
    }

    fn post_merge(&self, policy: MergePolicy, key: &CacheKey, _object: &EntityObject) {
        self.events.lock().push(RecordedEvent::PostMerge {
            policy,
            key: key.clone(),
        });
    }

    fn post_commit(&self, summary: &MergeSummary) {
        self.events.lock().push(RecordedEvent::PostCommit(summary.clone()));
    }
}
