//! Session: the shared cache and everything that writes to it
//!
//! A [`Session`] owns one identity map, its write-lock coordinator, the
//! descriptor registry, the data source and the event hooks. It is cheap to
//! clone and safe to share between threads; each thread works through its
//! own [`UnitOfWork`].
//!
//! ## Reading
//!
//! `read_original` returns the canonical object for a key: a valid cache
//! entry is returned as is, otherwise the row graph is loaded from the data
//! source and installed under ordered write locks. A session with a server
//! link (a remote client's mirror) reads through the server instead.
//!
//! ## Committing
//!
//! A unit of work's commit locks every key it writes in ascending key
//! order, validates optimistic locks against the locked entries, and only
//! then merges. A stale entry is validated against the newest lock value
//! it retained or the data source holds. A conflict fails the commit
//! before anything is written.

mod builder;
mod remote;

pub use builder::SessionBuilder;
pub use remote::RemoteSession;

use coherence_cache::{CacheEntry, IdentityMap};
use coherence_concurrency::{WriteLockCoordinator, WriteLockPolicy};
use coherence_core::{
    CacheKey, CoherenceError, CoherenceResult, DataSource, EntityObject, EntityType, ObjectId,
    ObjectSpace, SessionId, Timestamp, ValidationKind, Value, WriteLockValue,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::changeset::UnitOfWorkChangeSet;
use crate::config::CoherenceConfig;
use crate::descriptor::{CacheSynchronizationType, DescriptorRegistry, EntityDescriptor};
use crate::events::EventHooks;
use crate::merge::{
    check_new_object_version, CascadePolicy, MergeManager, MergePolicy, MergeSource,
    MergeSummary, MergeTarget,
};
use crate::metrics::{MergeMetrics, MergeMetricsSnapshot};
use crate::sequencing::Sequencing;
use crate::unit_of_work::UnitOfWork;

pub(crate) struct SessionInner {
    id: SessionId,
    config: CoherenceConfig,
    cascade: CascadePolicy,
    default_sync: CacheSynchronizationType,
    descriptors: Arc<DescriptorRegistry>,
    cache: Arc<IdentityMap>,
    coordinator: Arc<WriteLockCoordinator>,
    data_source: Arc<dyn DataSource>,
    sequencing: Sequencing,
    metrics: MergeMetrics,
    events: EventHooks,
    server: Option<Session>,
}

/// Shared-cache session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start building a session
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn from_inner(inner: SessionInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Session identity, the origin of its change sets
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Configuration the session was built with
    pub fn config(&self) -> &CoherenceConfig {
        &self.inner.config
    }

    /// Default cascade policy for clone merges
    pub fn default_cascade(&self) -> CascadePolicy {
        self.inner.cascade
    }

    /// Synchronization type for descriptors that do not set one
    pub fn default_sync(&self) -> CacheSynchronizationType {
        self.inner.default_sync
    }

    /// Registered descriptors
    pub fn descriptors(&self) -> &Arc<DescriptorRegistry> {
        &self.inner.descriptors
    }

    /// Descriptor for `entity`
    ///
    /// # Errors
    ///
    /// `DescriptorNotFound` if the entity is not registered.
    pub fn descriptor(&self, entity: &EntityType) -> CoherenceResult<Arc<EntityDescriptor>> {
        self.inner.descriptors.describe(entity)
    }

    /// Shared identity map
    pub fn cache(&self) -> &Arc<IdentityMap> {
        &self.inner.cache
    }

    /// Write-lock coordinator over the identity map
    pub fn coordinator(&self) -> &Arc<WriteLockCoordinator> {
        &self.inner.coordinator
    }

    /// Primary-key sequencing
    pub fn sequencing(&self) -> &Sequencing {
        &self.inner.sequencing
    }

    /// Merge counters
    pub fn metrics(&self) -> MergeMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn merge_metrics(&self) -> &MergeMetrics {
        &self.inner.metrics
    }

    /// Registered listeners
    pub fn events(&self) -> &EventHooks {
        &self.inner.events
    }

    /// Server session, for a remote client's mirror
    pub fn server(&self) -> Option<&Session> {
        self.inner.server.as_ref()
    }

    /// Start a unit of work
    pub fn acquire_unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(self.clone())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Canonical object for `key`, loaded if the cache has no valid entry
    ///
    /// # Errors
    ///
    /// Propagates data-source failures and lock timeouts.
    pub fn read_original(&self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        if let Some(object) = self.inner.cache.lookup_valid(key) {
            return Ok(Some(object));
        }
        match self.server() {
            Some(server) => self.read_through_server(server, key),
            None => self.load(key),
        }
    }

    /// Reload the canonical object for `key`, discarding the cached state
    pub fn refresh_original(&self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        if let Some(server) = self.server() {
            server.refresh_original(key)?;
        }
        self.inner.cache.invalidate(key);
        self.read_original(key)
    }

    fn read_through_server(
        &self,
        server: &Session,
        key: &CacheKey,
    ) -> CoherenceResult<Option<Arc<EntityObject>>> {
        let Some(source) = server.read_original(key)? else {
            return Ok(None);
        };
        let space: &dyn ObjectSpace = server.cache().as_ref();
        let mut merge = MergeManager::new(
            self,
            MergePolicy::RefreshRemote,
            MergeSource::Objects(space),
            MergeTarget::SharedCache,
        )?;
        let merged = merge.merge(Some(source.id()))?;
        merge.finish()?;
        Ok(merged.and_then(|id| self.inner.cache.resolve(id)))
    }

    /// Load the row graph reachable from `key` and install it
    ///
    /// Referenced rows already cached and valid are reused. Every key being
    /// installed is locked in ascending order first; an entry another
    /// thread made valid in the meantime wins over the loaded row.
    fn load(&self, key: &CacheKey) -> CoherenceResult<Option<Arc<EntityObject>>> {
        let mut rows = BTreeMap::new();
        let mut pending = vec![key.clone()];
        while let Some(next) = pending.pop() {
            if rows.contains_key(&next) {
                continue;
            }
            if &next != key && self.inner.cache.lookup_valid(&next).is_some() {
                continue;
            }
            let Some(row) = self.inner.data_source.read_row(&next.entity, &next.key)? else {
                continue;
            };
            for targets in row.references.values() {
                pending.extend(targets.iter().cloned());
            }
            rows.insert(next, row);
        }
        if !rows.contains_key(key) {
            debug!(target: "coherence::cache", key = %key, "no row for key");
            return Ok(None);
        }

        let guard = self.inner.coordinator.begin();
        let keys: Vec<CacheKey> = rows.keys().cloned().collect();
        let entries = self.inner.coordinator.acquire_ordered(guard.token(), &keys)?;
        let now = Timestamp::now();

        let mut objects = BTreeMap::new();
        for entry in &entries {
            let descriptor = self.descriptor(&entry.key().entity)?;
            let slot = match entry.object() {
                Some(object) if !entry.is_stale(now) => (object, false),
                Some(object) => (object, true),
                None => (descriptor.build_new_instance(), true),
            };
            objects.insert(entry.key().clone(), (slot.0, slot.1, descriptor));
        }

        for entry in &entries {
            let Some((object, install, descriptor)) = objects.get(entry.key()) else {
                continue;
            };
            let Some(row) = rows.get(entry.key()) else {
                continue;
            };
            if !install {
                continue;
            }
            let mut state = row.attributes.clone();
            for (attribute, targets) in &row.references {
                let ids: Vec<ObjectId> = targets
                    .iter()
                    .filter_map(|target| {
                        objects
                            .get(target)
                            .map(|(o, _, _)| o.id())
                            .or_else(|| self.inner.cache.lookup(target).map(|o| o.id()))
                    })
                    .collect();
                let collection = descriptor
                    .mapping(attribute)
                    .map_or(false, |m| m.is_collection());
                let value = if collection {
                    Value::RefList(ids)
                } else {
                    ids.first().copied().map(Value::Ref).unwrap_or(Value::Null)
                };
                state.insert(attribute.clone(), value);
            }
            let write_lock_value = descriptor.locking().and_then(|p| p.extract(&state));
            object.replace_state(state);
            self.inner.cache.install(
                entry,
                guard.token(),
                Arc::clone(object),
                write_lock_value,
                now,
            )?;
        }
        debug!(target: "coherence::cache", key = %key, rows = rows.len(), "loaded object graph");
        Ok(objects.remove(key).map(|(object, _, _)| object))
    }

    // ========================================================================
    // Merges into the shared cache
    // ========================================================================

    /// Merge a change set into the shared cache without commit validation
    ///
    /// Stale updates invalidate their entries instead of failing.
    pub fn merge_change_set(
        &self,
        change_set: &UnitOfWorkChangeSet,
        clones: Option<&dyn ObjectSpace>,
    ) -> CoherenceResult<MergeSummary> {
        let mut merge = MergeManager::new(
            self,
            MergePolicy::CommitToOriginal,
            MergeSource::ChangeSet { change_set, clones },
            MergeTarget::SharedCache,
        )?;
        merge.merge_change_set()
    }

    /// Apply a cooperating cache's change set
    pub fn apply_distributed_change_set(
        &self,
        change_set: &UnitOfWorkChangeSet,
    ) -> CoherenceResult<MergeSummary> {
        let mut merge = MergeManager::new(
            self,
            MergePolicy::DistributedCacheUpdate,
            MergeSource::ChangeSet {
                change_set,
                clones: None,
            },
            MergeTarget::SharedCache,
        )?;
        merge.merge_change_set()
    }

    /// Decode and apply a cooperating cache's encoded change set
    ///
    /// # Errors
    ///
    /// `Serialization` if the bytes do not decode.
    pub fn apply_distributed_bytes(&self, bytes: &[u8]) -> CoherenceResult<MergeSummary> {
        let change_set = UnitOfWorkChangeSet::from_bytes(bytes)?;
        self.apply_distributed_change_set(&change_set)
    }

    /// Remove expired cache entries
    pub fn sweep_expired(&self) -> usize {
        self.inner.cache.sweep_expired(Timestamp::now())
    }

    /// Newest lock value known for a stale entry: the value the entry
    /// retained when it was invalidated or the stored row's, whichever is
    /// newer. `None` when neither is known.
    fn stale_write_lock_value(
        &self,
        entry: &CacheEntry,
        policy: &dyn WriteLockPolicy,
    ) -> CoherenceResult<Option<WriteLockValue>> {
        let key = entry.key();
        let stored = self
            .inner
            .data_source
            .read_row(&key.entity, &key.key)?
            .and_then(|row| policy.extract(&row.attributes));
        let retained = entry.write_lock_value();
        Ok(match policy.compare_optional(retained.as_ref(), stored.as_ref()) {
            Ordering::Greater => retained,
            _ => stored,
        })
    }

    /// Validate and merge a unit of work's change set
    ///
    /// With a server link the server commits first and the mirror is
    /// updated from the same change set afterwards.
    pub(crate) fn commit_change_set_with(
        &self,
        change_set: &UnitOfWorkChangeSet,
        clones: Option<&dyn ObjectSpace>,
        suppress_validation: bool,
    ) -> CoherenceResult<MergeSummary> {
        if let Some(server) = self.server() {
            let summary = server.commit_change_set_with(change_set, clones, suppress_validation)?;
            let mut mirror = MergeManager::new(
                self,
                MergePolicy::CommitToRemote,
                MergeSource::ChangeSet { change_set, clones },
                MergeTarget::SharedCache,
            )?
            .with_suppress_validation(suppress_validation);
            mirror.merge_change_set()?;
            return Ok(summary);
        }

        let guard = self.inner.coordinator.begin();
        let keys: Vec<CacheKey> = change_set
            .iter()
            .filter(|cs| cs.has_changes() || cs.should_be_deleted)
            .filter(|cs| {
                self.inner
                    .descriptors
                    .get(&cs.entity)
                    .map_or(false, |d| !d.is_read_only() && !d.is_aggregate())
            })
            .filter_map(|cs| cs.key.clone())
            .collect();
        let entries = self.inner.coordinator.acquire_ordered(guard.token(), &keys)?;

        let now = Timestamp::now();
        for entry in &entries {
            let Some(object) = change_set
                .find_by_key(entry.key())
                .and_then(|id| change_set.get(id))
            else {
                continue;
            };
            let descriptor = self.descriptor(&object.entity)?;
            let live = entry.object().is_some() && !entry.is_stale(now);
            if object.is_new {
                check_new_object_version(&descriptor, object)?;
                if live {
                    return Err(CoherenceError::validation(
                        ValidationKind::ObjectAlreadyExists,
                        format!("{} already exists", entry.key()),
                    ));
                }
            } else if let Some(policy) = descriptor.locking() {
                let current = if live {
                    entry.write_lock_value()
                } else {
                    self.stale_write_lock_value(entry, policy.as_ref())?
                };
                let expected = object.initial_write_lock_value;
                if (live || current.is_some())
                    && policy.compare_optional(expected.as_ref(), current.as_ref()) != Ordering::Equal
                {
                    self.inner.metrics.record_conflict();
                    warn!(
                        target: "coherence::uow",
                        key = %entry.key(),
                        expected = ?expected,
                        found = ?current,
                        "optimistic lock conflict, commit rejected"
                    );
                    return Err(CoherenceError::OptimisticLock {
                        key: entry.key().clone(),
                        expected,
                        found: current,
                    });
                }
            }
        }

        let mut merge = MergeManager::new(
            self,
            MergePolicy::CommitToOriginal,
            MergeSource::ChangeSet { change_set, clones },
            MergeTarget::SharedCache,
        )?
        .with_suppress_validation(suppress_validation)
        .with_lock_guard(guard);
        let summary = merge.merge_change_set()?;

        self.inner.events.post_commit(&summary);
        self.inner.metrics.record_commit();
        info!(
            target: "coherence::uow",
            session = %self.id(),
            objects = change_set.len(),
            merged = summary.merged,
            invalidated = summary.invalidated,
            removed = summary.removed,
            "committed change set"
        );
        Ok(summary)
    }
}

impl ObjectSpace for Session {
    fn resolve(&self, id: ObjectId) -> Option<Arc<EntityObject>> {
        self.inner.cache.resolve(id)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("descriptors", &self.inner.descriptors.len())
            .field("cached", &self.inner.cache.len())
            .field("remote", &self.inner.server.is_some())
            .finish()
    }
}
