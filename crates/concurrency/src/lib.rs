//! Write-lock coordination and optimistic locking for Coherence
//!
//! This crate implements:
//! - WriteLockCoordinator: per-merge lock bookkeeping with deferred locking
//! - MergeLockGuard: releases a merge's locks on every exit path
//! - WriteLockPolicy: pluggable optimistic-lock comparators (version,
//!   timestamp)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod guard;
pub mod optimistic;
pub mod write_lock;

pub use guard::MergeLockGuard;
pub use optimistic::{TimestampLockingPolicy, VersionLockingPolicy, WriteLockPolicy};
pub use write_lock::{LockOutcome, WriteLockCoordinator};
