//! Error types for the merge engine
//!
//! All fallible operations return [`CoherenceResult`]. Lower layers keep
//! their own narrow error types (lock acquisition, change-set decoding)
//! and convert into [`CoherenceError`] with `From`.
//!
//! ## Classification
//!
//! - `is_optimistic_lock()`: a concurrent writer got there first; the
//!   caller may re-read and retry at the application level
//! - `is_suppressible()`: a validation failure a relaxed unit of work may
//!   swallow during a cascade
//! - `is_retryable()`: a lock could not be obtained in time; nothing was
//!   applied
//!
//! The engine never retries on its own.

use std::fmt;
use thiserror::Error;

use crate::lock_value::WriteLockValue;
use crate::types::{CacheKey, EntityType, ObjectId};

/// Result type alias for merge engine operations
pub type CoherenceResult<T> = std::result::Result<T, CoherenceError>;

/// Sub-kind of a validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    /// The backup clone of an object was deleted in the unit of work
    BackupCloneDeleted,
    /// The object being merged is the shared original, reached from a parent
    BackupCloneIsOriginalFromParent,
    /// The object being merged is the shared original, merged directly
    BackupCloneIsOriginalFromSelf,
    /// A new object collides with an existing registered object
    ObjectAlreadyExists,
    /// A handle does not belong to the unit of work it was passed to
    ObjectNotRegistered,
}

impl ValidationKind {
    /// Kinds a unit of work with relaxed validation may swallow
    pub const SUPPRESSIBLE: [ValidationKind; 3] = [
        ValidationKind::BackupCloneDeleted,
        ValidationKind::BackupCloneIsOriginalFromParent,
        ValidationKind::BackupCloneIsOriginalFromSelf,
    ];

    /// Check membership in the suppressible allow-list
    pub fn is_suppressible(&self) -> bool {
        Self::SUPPRESSIBLE.contains(self)
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationKind::BackupCloneDeleted => "backup clone deleted",
            ValidationKind::BackupCloneIsOriginalFromParent => {
                "backup clone is original (from parent)"
            }
            ValidationKind::BackupCloneIsOriginalFromSelf => "backup clone is original (from self)",
            ValidationKind::ObjectAlreadyExists => "object already exists",
            ValidationKind::ObjectNotRegistered => "object not registered",
        };
        f.write_str(name)
    }
}

fn lock_display(value: &Option<WriteLockValue>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

/// Error type for the merge engine
#[derive(Debug, Error)]
pub enum CoherenceError {
    /// Optimistic-lock conflict: the cache holds a different version than
    /// the one the unit of work read
    #[error(
        "optimistic lock conflict on {key}: expected {}, found {}",
        lock_display(.expected),
        lock_display(.found)
    )]
    OptimisticLock {
        /// Cache key of the conflicting object
        key: CacheKey,
        /// Version the unit of work started from
        expected: Option<WriteLockValue>,
        /// Version currently in the cache
        found: Option<WriteLockValue>,
    },

    /// A new object already carries a version newer than a fresh object
    /// could have
    #[error("object {object} changed since last merge (version {version})")]
    ObjectChangedSinceLastMerge {
        /// Object description
        object: String,
        /// The pre-set version
        version: WriteLockValue,
    },

    /// A merge source/target pairing that no policy accepts
    #[error("invalid merge policy {policy}: {detail}")]
    InvalidMergePolicy {
        /// Policy name
        policy: String,
        /// What was wrong
        detail: String,
    },

    /// A mapping does not support an operation its configuration requires
    #[error("invalid mapping operation: {mapping} on {entity} does not support {operation}")]
    InvalidMappingOperation {
        /// Attribute name of the mapping
        mapping: String,
        /// Operation that is unsupported
        operation: String,
        /// Owning entity
        entity: EntityType,
    },

    /// Validation failure
    #[error("validation failed ({kind}): {detail}")]
    Validation {
        /// Sub-kind
        kind: ValidationKind,
        /// Description
        detail: String,
    },

    /// Merge of an entity that was removed
    #[error("illegal state: cannot merge removed entity {object}")]
    RemovedEntityMerge {
        /// Object description
        object: String,
    },

    /// Operation not allowed in the current state
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description
        message: String,
    },

    /// Blocking lock acquisition exceeded the configured wait
    #[error("timed out after {waited_ms}ms waiting for write lock on {key}")]
    LockTimeout {
        /// Contended key
        key: CacheKey,
        /// Time waited
        waited_ms: u64,
    },

    /// No-wait lock acquisition found the entry held
    #[error("write lock on {key} is held by another merge")]
    LockUnavailable {
        /// Contended key
        key: CacheKey,
    },

    /// No descriptor registered for an entity type
    #[error("no descriptor for entity {entity}")]
    DescriptorNotFound {
        /// Entity type
        entity: EntityType,
    },

    /// An object needs a primary key and has none
    #[error("object {object} of {entity} has no primary key")]
    MissingPrimaryKey {
        /// Entity type
        entity: EntityType,
        /// Object description
        object: String,
    },

    /// A handle could not be resolved in the space it was expected in
    #[error("unknown object {id}")]
    UnknownObject {
        /// Handle
        id: ObjectId,
    },

    /// Data source failure
    #[error("data source error: {message}")]
    DataSource {
        /// Description
        message: String,
    },

    /// Invalid caller input
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description
        message: String,
    },

    /// Encoding or decoding failure
    #[error("serialization error: {message}")]
    Serialization {
        /// Description
        message: String,
    },

    /// Configuration file could not be read or is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description
        message: String,
    },

    /// Internal invariant violated
    #[error("internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },
}

impl CoherenceError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        CoherenceError::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        CoherenceError::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an illegal-state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        CoherenceError::IllegalState {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(kind: ValidationKind, detail: impl Into<String>) -> Self {
        CoherenceError::Validation {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        CoherenceError::Config {
            message: message.into(),
        }
    }

    /// Check if this is an optimistic-lock conflict
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(
            self,
            CoherenceError::OptimisticLock { .. } | CoherenceError::ObjectChangedSinceLastMerge { .. }
        )
    }

    /// Check if this is a validation error on the suppressible allow-list
    pub fn is_suppressible(&self) -> bool {
        matches!(self, CoherenceError::Validation { kind, .. } if kind.is_suppressible())
    }

    /// Validation sub-kind, if this is a validation error
    pub fn validation_kind(&self) -> Option<ValidationKind> {
        match self {
            CoherenceError::Validation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if the failed operation can be retried unchanged
    ///
    /// Only lock-availability failures qualify: they are raised before any
    /// state is applied. Merge and conflict errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoherenceError::LockTimeout { .. } | CoherenceError::LockUnavailable { .. }
        )
    }
}
