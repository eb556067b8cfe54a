//! Core types and traits for Coherence
//!
//! This crate defines the foundational types shared by the cache, the lock
//! coordinator and the merge engine:
//! - EntityType, PrimaryKey, CacheKey: object identity
//! - ObjectId: stable object handle used instead of pointer identity
//! - MergeToken: owner of write permits acquired by one merge
//! - SessionId: session identity
//! - Value / Attributes / EntityObject: object state
//! - WriteLockValue / Timestamp: optimistic-lock values and read times
//! - CoherenceError: error type hierarchy
//! - Traits: ObjectSpace, DataSource

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lock_value;
pub mod object;
pub mod timestamp;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{CoherenceError, CoherenceResult, ValidationKind};
pub use lock_value::WriteLockValue;
pub use object::{Attributes, EntityObject, ObjectGraph};
pub use timestamp::Timestamp;
pub use traits::{DataSource, EmptyDataSource, ObjectSpace, Row};
pub use types::{CacheKey, EntityType, KeyPart, MergeToken, ObjectId, PrimaryKey, SessionId};
pub use value::Value;
