//! Entity objects
//!
//! An [`EntityObject`] is one instance of a mapped entity: a stable handle,
//! its entity type, and its attribute state. The same type backs cache
//! originals, unit-of-work clones, backups and detached objects; only the
//! container that owns the `Arc` differs.
//!
//! ## Atomic state replacement
//!
//! Merges into a shared original never mutate attributes one at a time.
//! They build the replacement [`Attributes`] aside and install it with
//! [`EntityObject::replace_state`], so a concurrent reader sees either the
//! old state or the new one.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::traits::ObjectSpace;
use crate::types::{EntityType, ObjectId};
use crate::value::Value;

/// Attribute state of an object, keyed by attribute name
pub type Attributes = BTreeMap<String, Value>;

/// One instance of a mapped entity
#[derive(Debug)]
pub struct EntityObject {
    id: ObjectId,
    entity: EntityType,
    state: RwLock<Attributes>,
}

impl EntityObject {
    /// Construct an object with a fresh handle
    pub fn new(entity: impl Into<EntityType>, attributes: Attributes) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::next(),
            entity: entity.into(),
            state: RwLock::new(attributes),
        })
    }

    /// Construct an object with no attributes set
    pub fn empty(entity: impl Into<EntityType>) -> Arc<Self> {
        Self::new(entity, Attributes::new())
    }

    /// Stable handle
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Entity type
    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    /// Current value of one attribute (`None` when unset)
    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.state.read().get(attribute).cloned()
    }

    /// Copy of the full attribute state
    pub fn snapshot(&self) -> Attributes {
        self.state.read().clone()
    }

    /// Set one attribute
    ///
    /// For application code working on clones. Merges into shared
    /// originals use [`EntityObject::replace_state`].
    pub fn set(&self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.state.write().insert(attribute.into(), value.into());
    }

    /// Install a complete replacement state in one assignment
    pub fn replace_state(&self, attributes: Attributes) {
        *self.state.write() = attributes;
    }

    /// Run `f` with exclusive access to the attribute state
    pub fn update<R>(&self, f: impl FnOnce(&mut Attributes) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Run `f` with shared access to the attribute state
    pub fn with_state<R>(&self, f: impl FnOnce(&Attributes) -> R) -> R {
        f(&self.state.read())
    }
}

/// A set of detached objects addressed by handle
///
/// Used for object graphs that live outside any unit of work: a graph
/// returned from a remote server, or one built by application code before
/// being merged into a working copy.
#[derive(Debug, Default, Clone)]
pub struct ObjectGraph {
    objects: FxHashMap<ObjectId, Arc<EntityObject>>,
}

impl ObjectGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object, returning its handle
    pub fn insert(&mut self, object: Arc<EntityObject>) -> ObjectId {
        let id = object.id();
        self.objects.insert(id, object);
        id
    }

    /// Look up an object by handle
    pub fn get(&self, id: ObjectId) -> Option<&Arc<EntityObject>> {
        self.objects.get(&id)
    }

    /// Number of objects in the graph
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the graph has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate over the objects in the graph
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityObject>> {
        self.objects.values()
    }
}

impl ObjectSpace for ObjectGraph {
    fn resolve(&self, id: ObjectId) -> Option<Arc<EntityObject>> {
        self.objects.get(&id).cloned()
    }
}
