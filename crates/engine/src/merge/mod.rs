//! Merge manager
//!
//! A [`MergeManager`] carries one merge: a source representation (a change
//! set or a space of objects) is merged into a target representation (the
//! shared cache or a unit of work's working copies) under one
//! [`MergePolicy`]. Every policy shares the same traversal:
//!
//! 1. Terminal checks: a missing object merges to nothing and an object
//!    already recorded for the target returns the recorded result
//! 2. The target object is determined and recorded in the cycle guard
//!    before any reference is followed, so a cycle back to it resolves to
//!    the recorded result
//! 3. The policy's arm builds the target state and installs it in one
//!    assignment
//! 4. References are merged or resolved through the same manager, sharing
//!    the guard, according to the cascade policy
//!
//! ## Locking
//!
//! Cache-target merges acquire write locks through the session's
//! [`WriteLockCoordinator`](coherence_concurrency::WriteLockCoordinator)
//! under the manager's merge token. Entries met while the merge is in
//! deferred-lock mode are queued and merged after the rest of the graph,
//! one at a time with nothing else held. The lock guard is owned by the
//! manager, so every exit path releases what the merge acquired.
//!
//! ## Failure handling
//!
//! Errors propagate and abort the merge, except suppressible validation
//! errors raised below the top level when validation is relaxed: those are
//! logged, counted and the offending branch merges to nothing.

mod clone;
mod commit;
mod distributed;
mod refresh;
mod remote;

pub(crate) use commit::check_new_object_version;

use coherence_cache::IdentityMap;
use coherence_concurrency::{LockOutcome, MergeLockGuard};
use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, EntityObject, MergeToken, ObjectId,
    ObjectSpace, Timestamp,
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::changeset::{ChangeSetId, ObjectChangeSet, UnitOfWorkChangeSet};
use crate::descriptor::{AttributeMapping, EntityDescriptor};
use crate::session::Session;
use crate::unit_of_work::CloneRegistry;

/// What a merge does, and in which direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergePolicy {
    /// Unit-of-work changes into the shared cache
    CommitToOriginal,
    /// Shared-cache state into working copies (revert, refresh)
    RefreshFromOriginal,
    /// Detached objects into working copies
    CloneToWorkingCopy,
    /// Unit-of-work changes into a remote client's mirror
    CommitToRemote,
    /// Server objects into a remote client's mirror
    RefreshRemote,
    /// A cooperating cache's change set into the shared cache
    DistributedCacheUpdate,
    /// Detached objects and everything they reference into working copies
    CloneWithRefs,
}

impl MergePolicy {
    /// Policy name
    pub fn name(&self) -> &'static str {
        match self {
            MergePolicy::CommitToOriginal => "commit-to-original",
            MergePolicy::RefreshFromOriginal => "refresh-from-original",
            MergePolicy::CloneToWorkingCopy => "clone-to-working-copy",
            MergePolicy::CommitToRemote => "commit-to-remote",
            MergePolicy::RefreshRemote => "refresh-remote",
            MergePolicy::DistributedCacheUpdate => "distributed-cache-update",
            MergePolicy::CloneWithRefs => "clone-with-refs",
        }
    }

    /// Check if the policy merges into a cache
    pub fn targets_cache(&self) -> bool {
        matches!(
            self,
            MergePolicy::CommitToOriginal
                | MergePolicy::CommitToRemote
                | MergePolicy::RefreshRemote
                | MergePolicy::DistributedCacheUpdate
        )
    }

    fn is_commit(&self) -> bool {
        matches!(self, MergePolicy::CommitToOriginal | MergePolicy::CommitToRemote)
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How far merges follow references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Resolve references without merging the referenced objects
    None,
    /// Merge privately owned parts
    #[default]
    PrivateParts,
    /// Merge everything reachable
    AllParts,
    /// Merge references whose mapping asks for it
    ByMapping,
}

/// Where a merge reads from
#[derive(Clone, Copy)]
pub enum MergeSource<'a> {
    /// A change set, with the working copies it was computed from when
    /// they are available
    ChangeSet {
        /// The changes
        change_set: &'a UnitOfWorkChangeSet,
        /// Working copies, for rebuilding whole objects
        clones: Option<&'a dyn ObjectSpace>,
    },
    /// Objects resolved by handle
    Objects(&'a dyn ObjectSpace),
}

impl MergeSource<'_> {
    fn kind(&self) -> &'static str {
        match self {
            MergeSource::ChangeSet { .. } => "change set",
            MergeSource::Objects(_) => "object",
        }
    }
}

/// Where a merge writes to
pub enum MergeTarget<'a> {
    /// The session's identity map
    SharedCache,
    /// A unit of work's working copies
    WorkingCopies(&'a mut CloneRegistry),
}

impl MergeTarget<'_> {
    fn kind(&self) -> &'static str {
        match self {
            MergeTarget::SharedCache => "shared cache",
            MergeTarget::WorkingCopies(_) => "working copies",
        }
    }

    fn space(&self) -> TargetSpace {
        match self {
            MergeTarget::SharedCache => TargetSpace::SharedCache,
            MergeTarget::WorkingCopies(_) => TargetSpace::WorkingCopies,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TargetSpace {
    SharedCache,
    WorkingCopies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceHandle {
    Object(ObjectId),
    ChangeSet(ChangeSetId),
}

type GuardKey = (TargetSpace, SourceHandle);

/// Outcome counters of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Objects whose state was merged into the target
    pub merged: usize,
    /// Cache entries invalidated instead of merged
    pub invalidated: usize,
    /// Cache entries removed
    pub removed: usize,
    /// Objects queued behind a contended lock
    pub deferred: usize,
    /// Validation errors swallowed
    pub suppressed: usize,
    /// Objects left as they were
    pub skipped: usize,
    /// The merge switched to deferred locks
    pub transitioned_to_deferred_locks: bool,
}

struct DeferredMerge {
    key: CacheKey,
    source: SourceHandle,
    target: Arc<EntityObject>,
}

/// Recursive graph merge under one policy
pub struct MergeManager<'a> {
    session: Session,
    policy: MergePolicy,
    cascade: CascadePolicy,
    source: MergeSource<'a>,
    target: MergeTarget<'a>,
    guard: FxHashMap<GuardKey, Option<ObjectId>>,
    deferred: VecDeque<DeferredMerge>,
    depth: usize,
    suppress_validation: bool,
    read_time: Timestamp,
    lock_guard: Option<MergeLockGuard>,
    unresolved: usize,
    summary: MergeSummary,
}

impl<'a> MergeManager<'a> {
    /// Create a merge
    ///
    /// Cascade policy and validation relaxation default to the session's
    /// configuration.
    ///
    /// # Errors
    ///
    /// `InvalidMergePolicy` when `source` and `target` do not fit `policy`.
    pub fn new(
        session: &Session,
        policy: MergePolicy,
        source: MergeSource<'a>,
        target: MergeTarget<'a>,
    ) -> CoherenceResult<Self> {
        let fits = match (policy, &source, &target) {
            (
                MergePolicy::CommitToOriginal
                | MergePolicy::CommitToRemote
                | MergePolicy::DistributedCacheUpdate,
                MergeSource::ChangeSet { .. },
                MergeTarget::SharedCache,
            ) => true,
            (MergePolicy::RefreshRemote, MergeSource::Objects(_), MergeTarget::SharedCache) => true,
            (
                MergePolicy::RefreshFromOriginal
                | MergePolicy::CloneToWorkingCopy
                | MergePolicy::CloneWithRefs,
                MergeSource::Objects(_),
                MergeTarget::WorkingCopies(_),
            ) => true,
            _ => false,
        };
        if !fits {
            return Err(CoherenceError::InvalidMergePolicy {
                policy: policy.to_string(),
                detail: format!(
                    "cannot merge a {} source into {}",
                    source.kind(),
                    target.kind()
                ),
            });
        }

        Ok(Self {
            session: session.clone(),
            policy,
            cascade: session.default_cascade(),
            source,
            target,
            guard: FxHashMap::default(),
            deferred: VecDeque::new(),
            depth: 0,
            suppress_validation: session.config().suppress_validation,
            read_time: Timestamp::now(),
            lock_guard: None,
            unresolved: 0,
            summary: MergeSummary::default(),
        })
    }

    /// Override the cascade policy
    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// Override validation relaxation
    pub fn with_suppress_validation(mut self, suppress: bool) -> Self {
        self.suppress_validation = suppress;
        self
    }

    /// Read time recorded on cache entries this merge writes
    pub fn with_read_time(mut self, read_time: Timestamp) -> Self {
        self.read_time = read_time;
        self
    }

    /// Merge under an existing lock guard, e.g. one whose locks were
    /// acquired up front
    pub fn with_lock_guard(mut self, guard: MergeLockGuard) -> Self {
        self.lock_guard = Some(guard);
        self
    }

    /// Merge policy
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Cascade policy
    pub fn cascade(&self) -> CascadePolicy {
        self.cascade
    }

    /// Counters so far
    pub fn summary(&self) -> &MergeSummary {
        &self.summary
    }

    /// Token owning this merge's write locks, started on first use
    pub fn token(&mut self) -> MergeToken {
        let coordinator = self.session.coordinator();
        self.lock_guard
            .get_or_insert_with(|| coordinator.begin())
            .token()
    }

    /// Check if this merge switched to deferred locks
    pub fn is_transitioned_to_deferred_locks(&self) -> bool {
        self.summary.transitioned_to_deferred_locks
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Merge the object with handle `source_id`
    ///
    /// Returns the handle of the merged object in the target, or `None`
    /// when there is nothing to merge. For commit policies the handle is a
    /// working copy whose change set is merged.
    pub fn merge(&mut self, source_id: Option<ObjectId>) -> CoherenceResult<Option<ObjectId>> {
        let Some(id) = source_id else {
            return Ok(None);
        };
        self.guarded(|m| m.dispatch_object(id))
    }

    /// Merge every object change set of the source change set, in id order
    ///
    /// Deferred work is drained and the merge's locks are released before
    /// returning. A distributed merge skips change sets that originated in
    /// this session and notifies listeners before and after.
    ///
    /// # Errors
    ///
    /// `InvalidMergePolicy` if the source is not a change set; otherwise
    /// the first error raised by any object's merge.
    pub fn merge_change_set(&mut self) -> CoherenceResult<MergeSummary> {
        let change_set = self.source_change_set()?;
        let distributed = self.policy == MergePolicy::DistributedCacheUpdate;
        if distributed {
            if change_set.origin() == self.session.id() {
                debug!(target: "coherence::sync", origin = %change_set.origin(), "skipping own change set");
                return Ok(self.summary.clone());
            }
            self.session.events().pre_distributed_merge(change_set);
        }

        for object in change_set.iter() {
            let id = object.id;
            self.guarded(|m| m.dispatch_change_set(id))?;
        }
        self.drain_deferred()?;
        self.release_locks();

        if distributed {
            self.session.merge_metrics().record_distributed_merge();
            self.session
                .events()
                .post_distributed_merge(change_set, &self.summary);
            info!(
                target: "coherence::sync",
                origin = %change_set.origin(),
                merged = self.summary.merged,
                invalidated = self.summary.invalidated,
                removed = self.summary.removed,
                "applied distributed change set"
            );
        }
        Ok(self.summary.clone())
    }

    /// Drain deferred work, release locks and return the counters
    pub fn finish(mut self) -> CoherenceResult<MergeSummary> {
        self.drain_deferred()?;
        self.release_locks();
        Ok(std::mem::take(&mut self.summary))
    }

    /// Merge or resolve an object referenced through `mapping`
    ///
    /// Whether the referenced object's state is merged, or only its
    /// counterpart in the target is looked up, depends on the policy and
    /// the cascade policy.
    pub fn merge_reference(
        &mut self,
        source_id: ObjectId,
        mapping: &dyn AttributeMapping,
    ) -> CoherenceResult<Option<ObjectId>> {
        let cascade = match self.policy {
            MergePolicy::RefreshFromOriginal | MergePolicy::CloneToWorkingCopy => {
                self.should_cascade(mapping)
            }
            _ => true,
        };
        if cascade {
            self.merge(Some(source_id))
        } else {
            self.guarded(|m| m.resolve_reference(source_id))
        }
    }

    /// Merge the object change set `id` of the source change set
    pub fn merge_change_set_reference(
        &mut self,
        id: ChangeSetId,
    ) -> CoherenceResult<Option<ObjectId>> {
        let merged = self.guarded(|m| m.dispatch_change_set(id))?;
        if merged.is_none() {
            self.unresolved += 1;
        }
        Ok(merged)
    }

    /// Check if references through `mapping` are merged
    pub fn should_cascade(&self, mapping: &dyn AttributeMapping) -> bool {
        match self.policy {
            MergePolicy::CloneWithRefs | MergePolicy::RefreshRemote => true,
            _ => match self.cascade {
                CascadePolicy::None => false,
                CascadePolicy::PrivateParts => mapping.is_private_owned(),
                CascadePolicy::AllParts => true,
                CascadePolicy::ByMapping => mapping.cascades_merge(),
            },
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    fn guarded(
        &mut self,
        f: impl FnOnce(&mut Self) -> CoherenceResult<Option<ObjectId>>,
    ) -> CoherenceResult<Option<ObjectId>> {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        match result {
            Err(e) if self.depth > 0 && self.suppress_validation && e.is_suppressible() => {
                warn!(target: "coherence::merge", policy = %self.policy, error = %e, "suppressed validation error");
                self.summary.suppressed += 1;
                self.session.merge_metrics().record_suppressed();
                Ok(None)
            }
            other => other,
        }
    }

    /// Depth of the merge currently running, 1 at the top level
    fn is_nested(&self) -> bool {
        self.depth > 1
    }

    fn dispatch_object(&mut self, id: ObjectId) -> CoherenceResult<Option<ObjectId>> {
        match self.policy {
            MergePolicy::CommitToOriginal | MergePolicy::CommitToRemote => {
                match self.source_change_set()?.find_by_clone(id) {
                    Some(change_set) => self.merge_commit(change_set),
                    None => self.resolve_unchanged_clone(id),
                }
            }
            MergePolicy::DistributedCacheUpdate => Err(CoherenceError::InvalidMergePolicy {
                policy: self.policy.to_string(),
                detail: "distributed merges apply change sets, not objects".into(),
            }),
            MergePolicy::RefreshFromOriginal => self.merge_refresh(id),
            MergePolicy::CloneToWorkingCopy | MergePolicy::CloneWithRefs => self.merge_clone(id),
            MergePolicy::RefreshRemote => self.merge_refresh_remote(id),
        }
    }

    fn dispatch_change_set(&mut self, id: ChangeSetId) -> CoherenceResult<Option<ObjectId>> {
        match self.policy {
            MergePolicy::CommitToOriginal | MergePolicy::CommitToRemote => self.merge_commit(id),
            MergePolicy::DistributedCacheUpdate => self.merge_distributed(id),
            _ => Err(CoherenceError::InvalidMergePolicy {
                policy: self.policy.to_string(),
                detail: "policy merges objects, not change sets".into(),
            }),
        }
    }

    fn resolve_reference(&mut self, source_id: ObjectId) -> CoherenceResult<Option<ObjectId>> {
        match self.policy {
            MergePolicy::RefreshFromOriginal => self.resolve_refresh_reference(source_id),
            MergePolicy::CloneToWorkingCopy => self.resolve_clone_reference(source_id),
            _ => self.dispatch_object(source_id),
        }
    }

    fn recorded(&self, source: SourceHandle) -> Option<Option<ObjectId>> {
        self.guard.get(&(self.target.space(), source)).copied()
    }

    fn record(&mut self, source: SourceHandle, result: Option<ObjectId>) {
        let space = self.target.space();
        self.guard.insert((space, source), result);
    }

    /// Merge mapped state of `source` into `target`
    ///
    /// Mergeable mappings merge their attribute; cascade-only mappings
    /// merge their referenced objects when the cascade policy says so.
    /// Unmapped attributes other than the lock attribute are copied.
    pub(crate) fn merge_mapped_state(
        &mut self,
        descriptor: &EntityDescriptor,
        target: &mut Attributes,
        is_target_new: bool,
        source: &Attributes,
    ) -> CoherenceResult<()> {
        for mapping in descriptor.mappings() {
            if let Some(mergeable) = mapping.as_mergeable() {
                if mapping.is_read_only() && self.policy.is_commit() && !is_target_new {
                    continue;
                }
                mergeable.merge_into_object(target, is_target_new, source, self)?;
            } else if let Some(cascadable) = mapping.as_cascadable() {
                if self.should_cascade(mapping.as_ref()) {
                    for id in cascadable.cascade_targets(source) {
                        self.merge(Some(id))?;
                    }
                }
            }
        }
        let lock_attribute = descriptor.locking().map(|p| p.attribute());
        for (attr, value) in source {
            if descriptor.mapping(attr).is_none() && lock_attribute != Some(attr.as_str()) {
                target.insert(attr.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Apply each record of `change_set` to `target`
    pub(crate) fn apply_records(
        &mut self,
        descriptor: &EntityDescriptor,
        target: &mut Attributes,
        change_set: &ObjectChangeSet,
    ) -> CoherenceResult<()> {
        for record in change_set.changes.values() {
            match descriptor
                .mapping(&record.attribute)
                .and_then(|m| m.as_mergeable())
            {
                Some(mapping) => mapping.merge_changes_into_object(target, record, self)?,
                None => {
                    if let Some(value) = record.new_value() {
                        target.insert(record.attribute.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Locks and cache helpers
    // ========================================================================

    fn acquire(&mut self, key: &CacheKey) -> CoherenceResult<LockOutcome> {
        let token = self.token();
        let coordinator = Arc::clone(self.session.coordinator());
        let was_deferred = coordinator.is_transitioned_to_deferred_locks(token);
        let outcome = coordinator.acquire(token, key)?;
        if !was_deferred && coordinator.is_transitioned_to_deferred_locks(token) {
            self.summary.transitioned_to_deferred_locks = true;
            self.session.merge_metrics().record_deferred_transition();
        }
        Ok(outcome)
    }

    fn defer(&mut self, source: SourceHandle, key: CacheKey, target: Arc<EntityObject>) -> ObjectId {
        let id = target.id();
        self.record(source, Some(id));
        debug!(target: "coherence::merge", key = %key, "lock held elsewhere, deferring merge");
        self.deferred.push_back(DeferredMerge {
            key,
            source,
            target,
        });
        self.summary.deferred += 1;
        id
    }

    /// Merge deferred work one entry at a time, holding nothing else
    fn drain_deferred(&mut self) -> CoherenceResult<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        let token = self.token();
        let coordinator = Arc::clone(self.session.coordinator());
        while let Some(item) = self.deferred.pop_front() {
            coordinator.release_held(token);
            let entry = coordinator.acquire_blocking(token, &item.key)?;
            self.guarded(|m| m.process_deferred(item, entry))?;
        }
        coordinator.release_held(token);
        Ok(())
    }

    fn process_deferred(
        &mut self,
        item: DeferredMerge,
        entry: Arc<coherence_cache::CacheEntry>,
    ) -> CoherenceResult<Option<ObjectId>> {
        match (self.policy, item.source) {
            (
                MergePolicy::CommitToOriginal | MergePolicy::CommitToRemote,
                SourceHandle::ChangeSet(id),
            ) => {
                let change_set = self.object_change_set(id)?;
                let descriptor = self.session.descriptor(&change_set.entity)?;
                if change_set.should_be_deleted {
                    self.remove_entry(item.source, &entry)
                } else {
                    self.commit_into_entry(change_set, &descriptor, &entry, Some(item.target))
                }
            }
            (MergePolicy::DistributedCacheUpdate, SourceHandle::ChangeSet(id)) => {
                let change_set = self.object_change_set(id)?;
                let descriptor = self.session.descriptor(&change_set.entity)?;
                self.distributed_into_entry(change_set, &descriptor, &entry, Some(item.target))
            }
            (MergePolicy::RefreshRemote, SourceHandle::Object(id)) => {
                let source = self.source_object(id)?;
                let descriptor = self.session.descriptor(source.entity())?;
                self.refresh_remote_into_entry(&source, &descriptor, &entry, Some(item.target))
            }
            (policy, _) => Err(CoherenceError::internal(format!(
                "deferred work for {} merge with mismatched source",
                policy
            ))),
        }
    }

    fn remove_entry(
        &mut self,
        source: SourceHandle,
        entry: &Arc<coherence_cache::CacheEntry>,
    ) -> CoherenceResult<Option<ObjectId>> {
        let token = self.token();
        if self.session.cache().remove(entry, token)?.is_some() {
            self.summary.removed += 1;
            debug!(target: "coherence::merge", key = %entry.key(), "removed deleted object from cache");
        }
        self.record(source, None);
        Ok(None)
    }

    fn invalidate(&mut self, key: &CacheKey) {
        if self.session.cache().invalidate(key) {
            self.summary.invalidated += 1;
            self.session.merge_metrics().record_invalidated();
        }
    }

    fn record_merged(&mut self, key: &CacheKey, object: &EntityObject) {
        self.summary.merged += 1;
        self.session.merge_metrics().record_merged();
        self.session.events().post_merge(self.policy, key, object);
        debug!(target: "coherence::merge", policy = %self.policy, key = %key, "merged object");
    }

    fn release_locks(&mut self) {
        self.lock_guard = None;
    }

    fn cache(&self) -> Arc<IdentityMap> {
        Arc::clone(self.session.cache())
    }

    // ========================================================================
    // Source and target access
    // ========================================================================

    fn source_change_set(&self) -> CoherenceResult<&'a UnitOfWorkChangeSet> {
        match self.source {
            MergeSource::ChangeSet { change_set, .. } => Ok(change_set),
            MergeSource::Objects(_) => Err(CoherenceError::InvalidMergePolicy {
                policy: self.policy.to_string(),
                detail: "merge source is not a change set".into(),
            }),
        }
    }

    fn object_change_set(&self, id: ChangeSetId) -> CoherenceResult<&'a ObjectChangeSet> {
        self.source_change_set()?
            .get(id)
            .ok_or_else(|| CoherenceError::internal(format!("unknown change set {}", id)))
    }

    fn source_clones(&self) -> Option<&'a dyn ObjectSpace> {
        match self.source {
            MergeSource::ChangeSet { clones, .. } => clones,
            MergeSource::Objects(_) => None,
        }
    }

    fn source_objects(&self) -> CoherenceResult<&'a dyn ObjectSpace> {
        match self.source {
            MergeSource::Objects(space) => Ok(space),
            MergeSource::ChangeSet { .. } => Err(CoherenceError::InvalidMergePolicy {
                policy: self.policy.to_string(),
                detail: "merge source is not an object space".into(),
            }),
        }
    }

    fn source_object(&self, id: ObjectId) -> CoherenceResult<Arc<EntityObject>> {
        self.source_objects()?
            .resolve(id)
            .ok_or(CoherenceError::UnknownObject { id })
    }

    fn registry(&mut self) -> CoherenceResult<&mut CloneRegistry> {
        match &mut self.target {
            MergeTarget::WorkingCopies(registry) => Ok(&mut **registry),
            MergeTarget::SharedCache => Err(CoherenceError::InvalidMergePolicy {
                policy: self.policy.to_string(),
                detail: "merge target is not a unit of work".into(),
            }),
        }
    }
}

impl fmt::Debug for MergeManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeManager")
            .field("policy", &self.policy)
            .field("cascade", &self.cascade)
            .field("source", &self.source.kind())
            .field("target", &self.target.kind())
            .field("recorded", &self.guard.len())
            .field("deferred", &self.deferred.len())
            .field("summary", &self.summary)
            .finish()
    }
}
