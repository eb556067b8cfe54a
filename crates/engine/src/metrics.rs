//! Merge counters for a session
//!
//! Every merge run through a session bumps these counters. They are
//! observational only.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live merge counters
///
/// # Memory Ordering
///
/// All counters use Relaxed ordering. They do not synchronize any other
/// memory operations and approximate counts are acceptable for monitoring.
#[derive(Debug, Default)]
pub struct MergeMetrics {
    objects_merged: AtomicU64,
    entries_invalidated: AtomicU64,
    optimistic_lock_conflicts: AtomicU64,
    deferred_transitions: AtomicU64,
    suppressed_validation_errors: AtomicU64,
    commits: AtomicU64,
    distributed_merges: AtomicU64,
}

impl MergeMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_merged(&self) {
        self.objects_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidated(&self) {
        self.entries_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.optimistic_lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred_transition(&self) {
        self.deferred_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed_validation_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_distributed_merge(&self) {
        self.distributed_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MergeMetricsSnapshot {
        MergeMetricsSnapshot {
            objects_merged: self.objects_merged.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
            optimistic_lock_conflicts: self.optimistic_lock_conflicts.load(Ordering::Relaxed),
            deferred_transitions: self.deferred_transitions.load(Ordering::Relaxed),
            suppressed_validation_errors: self
                .suppressed_validation_errors
                .load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            distributed_merges: self.distributed_merges.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`MergeMetrics`] at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeMetricsSnapshot {
    /// Objects whose state was merged into a target
    pub objects_merged: u64,
    /// Cache entries invalidated by merges
    pub entries_invalidated: u64,
    /// Optimistic-lock conflicts detected
    pub optimistic_lock_conflicts: u64,
    /// Merges that switched to deferred locks
    pub deferred_transitions: u64,
    /// Validation errors swallowed during cascades
    pub suppressed_validation_errors: u64,
    /// Successful unit-of-work commits
    pub commits: u64,
    /// Peer change sets applied
    pub distributed_merges: u64,
}

impl MergeMetricsSnapshot {
    /// Fraction of commits that hit an optimistic-lock conflict
    pub fn conflict_rate(&self) -> f64 {
        let attempts = self.commits + self.optimistic_lock_conflicts;
        if attempts > 0 {
            self.optimistic_lock_conflicts as f64 / attempts as f64
        } else {
            0.0
        }
    }
}
