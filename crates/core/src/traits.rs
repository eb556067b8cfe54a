//! Core trait definitions
//!
//! This module defines the narrow seams between the merge engine and its
//! collaborators:
//! - ObjectSpace: resolve an object handle to an object
//! - DataSource: read one row for an entity by primary key
//!
//! Both are object-safe and `Send + Sync` so they can be held as
//! `Arc<dyn ...>` by a session shared across threads.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::CoherenceResult;
use crate::object::{Attributes, EntityObject};
use crate::types::{CacheKey, EntityType, ObjectId, PrimaryKey};

/// A space of objects addressable by handle
///
/// Implemented by the shared identity map, a unit of work's clone
/// registry, and detached object graphs. Reference attributes hold
/// handles; following one means resolving it in the space that owns the
/// referencing object.
pub trait ObjectSpace {
    /// Resolve a handle, `None` if the object is not part of this space
    fn resolve(&self, id: ObjectId) -> Option<Arc<EntityObject>>;
}

/// One row as returned by the data source
///
/// Relationship columns are returned as the cache keys of the referenced
/// rows, in collection order; the session turns them into handles when it
/// builds the object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Basic and embedded attribute values
    pub attributes: Attributes,
    /// Foreign keys per relationship attribute
    pub references: BTreeMap<String, Vec<CacheKey>>,
}

impl Row {
    /// Create a row from attribute values only
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            references: BTreeMap::new(),
        }
    }

    /// Add a foreign key for a relationship attribute
    pub fn with_reference(mut self, attribute: impl Into<String>, target: CacheKey) -> Self {
        self.references
            .entry(attribute.into())
            .or_default()
            .push(target);
        self
    }
}

/// Source of persistent rows
///
/// The engine performs no I/O itself. Reading an object that is not in the
/// shared cache goes through this trait.
pub trait DataSource: Send + Sync {
    /// Read the row for `key` of `entity`, `Ok(None)` if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `CoherenceError::DataSource` if the read itself fails.
    fn read_row(&self, entity: &EntityType, key: &PrimaryKey) -> CoherenceResult<Option<Row>>;
}

/// A data source with no rows
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDataSource;

impl DataSource for EmptyDataSource {
    fn read_row(&self, _entity: &EntityType, _key: &PrimaryKey) -> CoherenceResult<Option<Row>> {
        Ok(None)
    }
}
