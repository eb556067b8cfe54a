//! Shared identity map for Coherence
//!
//! This crate provides the process-wide object cache:
//! - IdentityMap: `(entity type, primary key)` → CacheEntry, sharded
//! - CacheEntry: canonical object, lock value, read time, write permit
//! - WritePermit: single-writer permit owned by a merge token
//! - CacheInvalidationPolicy: per-entity expiry rules
//!
//! The identity map is the only mutable state shared between units of
//! work. Everything above it (lock coordination, merging) is private to
//! one merge.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod identity_map;
pub mod invalidation;

pub use entry::{CacheEntry, EntrySnapshot, WritePermit};
pub use identity_map::{AcquireError, AcquireMode, IdentityMap, IdentityMapStats};
pub use invalidation::{CacheInvalidationPolicy, ExpiryIndex};
