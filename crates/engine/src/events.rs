//! Merge event hooks
//!
//! Observers register a [`MergeListener`] on a session. The engine calls
//! them at fixed points and never depends on what they do.

use coherence_core::{CacheKey, EntityObject};
use std::fmt;
use std::sync::Arc;

use crate::changeset::UnitOfWorkChangeSet;
use crate::merge::{MergePolicy, MergeSummary};

/// Callbacks invoked around merges
///
/// Every method has an empty default, so a listener only implements the
/// hooks it cares about. Listeners run on the merging thread, while the
/// merge may hold write locks; they must not block on the cache.
pub trait MergeListener: Send + Sync {
    /// Before a peer's change set is applied
    fn pre_distributed_merge(&self, _change_set: &UnitOfWorkChangeSet) {}

    /// After a peer's change set was applied
    fn post_distributed_merge(&self, _change_set: &UnitOfWorkChangeSet, _summary: &MergeSummary) {
    }

    /// After one object was merged into a cache entry
    fn post_merge(&self, _policy: MergePolicy, _key: &CacheKey, _object: &EntityObject) {}

    /// After a unit of work's change set was merged into the shared cache
    fn post_commit(&self, _summary: &MergeSummary) {}
}

/// Registered listeners, called in registration order
#[derive(Clone, Default)]
pub struct EventHooks {
    listeners: Vec<Arc<dyn MergeListener>>,
}

impl EventHooks {
    /// No listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&mut self, listener: Arc<dyn MergeListener>) {
        self.listeners.push(listener);
    }

    /// Number of listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Check if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn pre_distributed_merge(&self, change_set: &UnitOfWorkChangeSet) {
        for l in &self.listeners {
            l.pre_distributed_merge(change_set);
        }
    }

    pub(crate) fn post_distributed_merge(
        &self,
        change_set: &UnitOfWorkChangeSet,
        summary: &MergeSummary,
    ) {
        for l in &self.listeners {
            l.post_distributed_merge(change_set, summary);
        }
    }

    pub(crate) fn post_merge(&self, policy: MergePolicy, key: &CacheKey, object: &EntityObject) {
        for l in &self.listeners {
            l.post_merge(policy, key, object);
        }
    }

    pub(crate) fn post_commit(&self, summary: &MergeSummary) {
        for l in &self.listeners {
            l.post_commit(summary);
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
