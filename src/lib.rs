//! Coherence - unit-of-work merge and cache-coherency engine
//!
//! Coherence keeps a shared, identity-mapped object cache consistent while
//! many units of work read, edit and commit objects concurrently, and while
//! cooperating caches exchange change sets.
//!
//! # Quick Start
//!
//! ```ignore
//! use coherence::{CacheKey, EntityDescriptor, PrimaryKey, Session};
//!
//! let session = Session::builder()
//!     .descriptor(
//!         EntityDescriptor::builder("Employee")
//!             .primary_key(["id"])
//!             .direct("id")
//!             .direct("salary")
//!             .version_locking("version")
//!             .build()?,
//!     )
//!     .data_source(rows)
//!     .build()?;
//!
//! let mut uow = session.acquire_unit_of_work();
//! let employee = uow.read_object(&CacheKey::new("Employee", PrimaryKey::int(1)))?;
//! if let Some(employee) = employee {
//!     uow.set_attribute(employee.id(), "salary", 150i64)?;
//! }
//! uow.commit()?;
//! ```
//!
//! # Architecture
//!
//! - `coherence-core`: object model, identity types, values and errors
//! - `coherence-cache`: the shared identity map and its invalidation policies
//! - `coherence-concurrency`: per-entry write locks and optimistic locking
//! - `coherence-engine`: sessions, units of work, change sets and merges
//!
//! Everything an application needs is re-exported here.

pub use coherence_cache::{CacheEntry, CacheInvalidationPolicy, IdentityMap, IdentityMapStats};
pub use coherence_concurrency::{
    MergeLockGuard, TimestampLockingPolicy, VersionLockingPolicy, WriteLockCoordinator,
    WriteLockPolicy,
};
pub use coherence_core::*;
pub use coherence_engine::*;
