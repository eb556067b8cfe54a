//! Merge engine for the coherence runtime
//!
//! This crate ties the shared cache and the write-lock coordinator together:
//! - Session: descriptors, shared cache and lock coordinator in one handle
//! - UnitOfWork: isolated working copies and change computation
//! - Change sets: per-object change records produced by a unit of work
//! - MergeManager: merges change sets and object graphs under one policy
//! - RemoteSession: client mirror kept in line with a server session
//!
//! The engine is the only component that knows about:
//! - Descriptors and attribute mappings
//! - Merge policies and cascades
//! - Distribution of change sets between cooperating caches

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changeset;
pub mod config;
pub mod descriptor;
pub mod events;
pub mod merge;
pub mod metrics;
pub mod sequencing;
pub mod session;
pub mod testing;
pub mod unit_of_work;

pub use changeset::{
    AttributeChange, ChangeContext, ChangeRecord, ChangeSetCodecError, ChangeSetId,
    ObjectChangeSet, UnitOfWorkChangeSet,
};
pub use config::{CoherenceConfig, CONFIG_FILE_NAME};
pub use descriptor::{
    AggregateMapping, AttributeMapping, CacheSynchronizationType, CascadableMapping,
    ChangeTrackingPolicy, CollectionMapping, ComparableMapping, DescriptorBuilder,
    DescriptorRegistry, DirectMapping, EntityDescriptor, HeterogeneousCollectionMapping,
    MergeableMapping, ReferenceMapping,
};
pub use events::{EventHooks, MergeListener};
pub use merge::{CascadePolicy, MergeManager, MergePolicy, MergeSource, MergeSummary, MergeTarget};
pub use metrics::{MergeMetrics, MergeMetricsSnapshot};
pub use sequencing::Sequencing;
pub use session::{RemoteSession, Session, SessionBuilder};
pub use unit_of_work::{CloneRegistry, UnitOfWork, UnitOfWorkStatus};
