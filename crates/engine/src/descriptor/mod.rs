//! Entity descriptors
//!
//! A descriptor tells the engine everything it needs about one entity type:
//! which attributes form the primary key, the ordered attribute mappings,
//! the optimistic locking policy, how changes are tracked and how the cache
//! treats its objects. Descriptors are built once, validated eagerly, and
//! shared read-only through a [`DescriptorRegistry`].

pub mod direct;
pub mod mapping;
pub mod relationship;

pub use direct::{AggregateMapping, DirectMapping};
pub use mapping::{
    remap_references, AttributeMapping, CascadableMapping, ComparableMapping, MergeableMapping,
    RemapFn,
};
pub use relationship::{CollectionMapping, HeterogeneousCollectionMapping, ReferenceMapping};

use coherence_cache::CacheInvalidationPolicy;
use coherence_concurrency::{TimestampLockingPolicy, VersionLockingPolicy, WriteLockPolicy};
use coherence_core::{
    Attributes, CacheKey, CoherenceError, CoherenceResult, EntityObject, EntityType, KeyPart,
    PrimaryKey,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// How a unit of work finds changed objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeTrackingPolicy {
    /// Diff every registered clone against its backup at commit
    #[default]
    Deferred,
    /// Diff only objects marked changed through the unit of work
    ObjectLevel,
    /// Diff only the attributes set through the unit of work
    AttributeLevel,
}

/// What a committed change to this entity sends to cooperating caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheSynchronizationType {
    /// Send attribute changes of existing objects
    #[default]
    SendObjectChanges,
    /// Send only an invalidation marker
    InvalidateChangedObjects,
    /// Send changes of existing objects and complete new objects
    SendNewObjectsWithChanges,
    /// Send nothing
    DoNotSend,
}

/// Validated metadata for one entity type
#[derive(Debug)]
pub struct EntityDescriptor {
    entity: EntityType,
    primary_key: Vec<String>,
    mappings: Vec<Arc<dyn AttributeMapping>>,
    by_attribute: FxHashMap<String, usize>,
    locking: Option<Arc<dyn WriteLockPolicy>>,
    change_tracking: ChangeTrackingPolicy,
    read_only: bool,
    aggregate: bool,
    sequenced: bool,
    invalidation: Option<CacheInvalidationPolicy>,
    sync_type: Option<CacheSynchronizationType>,
}

impl EntityDescriptor {
    /// Start building a descriptor for `entity`
    pub fn builder(entity: impl Into<EntityType>) -> DescriptorBuilder {
        DescriptorBuilder::new(entity)
    }

    /// Entity type
    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    /// Primary key attribute names, in key order
    pub fn primary_key_attributes(&self) -> &[String] {
        &self.primary_key
    }

    /// Primary key of an object state
    ///
    /// `None` when any key attribute is missing, null, or not a key type.
    pub fn primary_key_of(&self, state: &Attributes) -> Option<PrimaryKey> {
        if self.primary_key.is_empty() {
            return None;
        }
        let parts = self
            .primary_key
            .iter()
            .map(|attr| state.get(attr).and_then(KeyPart::from_value))
            .collect::<Option<Vec<_>>>()?;
        Some(PrimaryKey::new(parts))
    }

    /// Identity-map key of an object state
    pub fn cache_key_of(&self, state: &Attributes) -> Option<CacheKey> {
        self.primary_key_of(state)
            .map(|key| CacheKey::new(self.entity.clone(), key))
    }

    /// Mappings in declaration order
    pub fn mappings(&self) -> &[Arc<dyn AttributeMapping>] {
        &self.mappings
    }

    /// Mapping for one attribute
    pub fn mapping(&self, attribute: &str) -> Option<&Arc<dyn AttributeMapping>> {
        self.by_attribute.get(attribute).map(|&i| &self.mappings[i])
    }

    /// Optimistic locking policy
    pub fn locking(&self) -> Option<&Arc<dyn WriteLockPolicy>> {
        self.locking.as_ref()
    }

    /// Change tracking policy
    pub fn change_tracking(&self) -> ChangeTrackingPolicy {
        self.change_tracking
    }

    /// Objects of this type are never modified through merges
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Objects of this type only exist embedded in an owner
    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    /// New objects get their primary key from sequencing
    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }

    /// Cache invalidation policy, if set on the descriptor
    pub fn invalidation(&self) -> Option<CacheInvalidationPolicy> {
        self.invalidation
    }

    /// Cache synchronization type, if set on the descriptor
    pub fn sync_type(&self) -> Option<CacheSynchronizationType> {
        self.sync_type
    }

    /// New empty instance of this entity
    pub fn build_new_instance(&self) -> Arc<EntityObject> {
        EntityObject::empty(self.entity.clone())
    }

    /// State for a working copy of `original`
    ///
    /// Mapped attributes are cloned by their mapping, which rewrites object
    /// handles through `remap`; unmapped attributes are copied unchanged.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `remap`.
    pub fn populate_attributes_for_clone(
        &self,
        original: &Attributes,
        remap: &mut RemapFn<'_>,
    ) -> CoherenceResult<Attributes> {
        let mut clone = Attributes::new();
        for (attr, value) in original {
            let cloned = match self.mapping(attr) {
                Some(mapping) => mapping.build_clone_value(value, remap)?,
                None => value.clone(),
            };
            clone.insert(attr.clone(), cloned);
        }
        Ok(clone)
    }
}

/// Builder for [`EntityDescriptor`]
///
/// # Example
///
/// ```ignore
/// let employee = EntityDescriptor::builder("Employee")
///     .primary_key(["id"])
///     .direct("id")
///     .direct("salary")
///     .reference("manager")
///     .version_locking("version")
///     .build()?;
/// ```
#[derive(Debug)]
pub struct DescriptorBuilder {
    entity: EntityType,
    primary_key: Vec<String>,
    mappings: Vec<Arc<dyn AttributeMapping>>,
    locking: Option<Arc<dyn WriteLockPolicy>>,
    change_tracking: ChangeTrackingPolicy,
    read_only: bool,
    aggregate: bool,
    sequenced: bool,
    invalidation: Option<CacheInvalidationPolicy>,
    sync_type: Option<CacheSynchronizationType>,
}

impl DescriptorBuilder {
    /// Builder with no mappings
    pub fn new(entity: impl Into<EntityType>) -> Self {
        Self {
            entity: entity.into(),
            primary_key: Vec::new(),
            mappings: Vec::new(),
            locking: None,
            change_tracking: ChangeTrackingPolicy::default(),
            read_only: false,
            aggregate: false,
            sequenced: false,
            invalidation: None,
            sync_type: None,
        }
    }

    /// Primary key attributes, in key order
    pub fn primary_key<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Add a mapping
    pub fn mapping(mut self, mapping: Arc<dyn AttributeMapping>) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Add a direct (basic value) mapping
    pub fn direct(self, attribute: impl Into<String>) -> Self {
        self.mapping(Arc::new(DirectMapping::new(attribute)))
    }

    /// Add an embedded-value mapping
    pub fn embedded(self, attribute: impl Into<String>) -> Self {
        self.mapping(Arc::new(AggregateMapping::new(attribute)))
    }

    /// Add a single-valued reference mapping
    pub fn reference(self, attribute: impl Into<String>) -> Self {
        self.mapping(Arc::new(ReferenceMapping::new(attribute)))
    }

    /// Add a collection mapping
    pub fn collection(self, attribute: impl Into<String>) -> Self {
        self.mapping(Arc::new(CollectionMapping::new(attribute)))
    }

    /// Use an explicit optimistic locking policy
    pub fn locking(mut self, policy: Arc<dyn WriteLockPolicy>) -> Self {
        self.locking = Some(policy);
        self
    }

    /// Integer version locking on `attribute`
    pub fn version_locking(self, attribute: impl Into<String>) -> Self {
        self.locking(Arc::new(VersionLockingPolicy::new(attribute)))
    }

    /// Timestamp locking on `attribute`
    pub fn timestamp_locking(self, attribute: impl Into<String>) -> Self {
        self.locking(Arc::new(TimestampLockingPolicy::new(attribute)))
    }

    /// Change tracking policy
    pub fn change_tracking(mut self, policy: ChangeTrackingPolicy) -> Self {
        self.change_tracking = policy;
        self
    }

    /// Mark the entity read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark the entity as an aggregate (no identity of its own)
    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    /// Assign primary keys of new objects from sequencing
    pub fn sequenced(mut self) -> Self {
        self.sequenced = true;
        self
    }

    /// Cache invalidation policy
    pub fn invalidation(mut self, policy: CacheInvalidationPolicy) -> Self {
        self.invalidation = Some(policy);
        self
    }

    /// Cache synchronization type
    pub fn sync_type(mut self, sync_type: CacheSynchronizationType) -> Self {
        self.sync_type = Some(sync_type);
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a missing primary key, a duplicate mapping, or a
    ///   sequenced entity without exactly one key attribute
    /// - `InvalidMappingOperation` for a writable mapping that cannot
    ///   compute change records or merge state
    pub fn build(self) -> CoherenceResult<EntityDescriptor> {
        if self.primary_key.is_empty() && !self.aggregate {
            return Err(CoherenceError::invalid_input(format!(
                "descriptor for {} has no primary key",
                self.entity
            )));
        }
        if self.sequenced && self.primary_key.len() != 1 {
            return Err(CoherenceError::invalid_input(format!(
                "sequenced descriptor for {} needs exactly one primary key attribute",
                self.entity
            )));
        }

        let mut seen = HashSet::new();
        let mut by_attribute = FxHashMap::default();
        for (i, mapping) in self.mappings.iter().enumerate() {
            let attr = mapping.attribute();
            if !seen.insert(attr.to_string()) {
                return Err(CoherenceError::invalid_input(format!(
                    "duplicate mapping for {}.{}",
                    self.entity, attr
                )));
            }
            if !mapping.is_read_only() {
                let missing = if mapping.as_comparable().is_none() {
                    Some("compare_for_change")
                } else if mapping.as_mergeable().is_none() {
                    Some("merge_into_object")
                } else {
                    None
                };
                if let Some(operation) = missing {
                    return Err(CoherenceError::InvalidMappingOperation {
                        mapping: attr.to_string(),
                        operation: operation.to_string(),
                        entity: self.entity.clone(),
                    });
                }
            }
            by_attribute.insert(attr.to_string(), i);
        }

        Ok(EntityDescriptor {
            entity: self.entity,
            primary_key: self.primary_key,
            mappings: self.mappings,
            by_attribute,
            locking: self.locking,
            change_tracking: self.change_tracking,
            read_only: self.read_only,
            aggregate: self.aggregate,
            sequenced: self.sequenced,
            invalidation: self.invalidation,
            sync_type: self.sync_type,
        })
    }
}

/// Descriptors by entity type
#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
    descriptors: FxHashMap<EntityType, Arc<EntityDescriptor>>,
}

impl DescriptorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one for its entity
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Arc<EntityDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.descriptors
            .insert(descriptor.entity().clone(), Arc::clone(&descriptor));
        descriptor
    }

    /// Descriptor for `entity`
    ///
    /// # Errors
    ///
    /// `DescriptorNotFound` if none is registered.
    pub fn describe(&self, entity: &EntityType) -> CoherenceResult<Arc<EntityDescriptor>> {
        self.descriptors
            .get(entity)
            .cloned()
            .ok_or_else(|| CoherenceError::DescriptorNotFound {
                entity: entity.clone(),
            })
    }

    /// Descriptor for `entity`, if registered
    pub fn get(&self, entity: &EntityType) -> Option<&Arc<EntityDescriptor>> {
        self.descriptors.get(entity)
    }

    /// Registered entity types, sorted
    pub fn entities(&self) -> Vec<EntityType> {
        let mut entities: Vec<EntityType> = self.descriptors.keys().cloned().collect();
        entities.sort();
        entities
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if no descriptor is registered
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::Value;

    fn employee() -> EntityDescriptor {
        EntityDescriptor::builder("Employee")
            .primary_key(["id"])
            .direct("id")
            .direct("salary")
            .reference("manager")
            .version_locking("version")
            .build()
            .unwrap()
    }

    #[test]
    fn test_cache_key_extraction() {
        let d = employee();
        let mut state = Attributes::new();
        assert!(d.cache_key_of(&state).is_none());

        state.insert("id".into(), Value::Int(7));
        assert_eq!(
            d.cache_key_of(&state),
            Some(CacheKey::new("Employee", PrimaryKey::int(7)))
        );

        state.insert("id".into(), Value::Null);
        assert!(d.primary_key_of(&state).is_none());
    }

    #[test]
    fn test_mapping_lookup() {
        let d = employee();
        assert_eq!(d.mappings().len(), 3);
        assert!(d.mapping("manager").unwrap().is_relationship());
        assert!(d.mapping("version").is_none());
        assert_eq!(d.locking().unwrap().attribute(), "version");
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let err = EntityDescriptor::builder("Employee")
            .direct("name")
            .build()
            .unwrap_err();
        assert!(matches!(err, CoherenceError::InvalidInput { .. }));
    }

    #[test]
    fn test_aggregate_needs_no_primary_key() {
        let d = EntityDescriptor::builder("Address")
            .aggregate()
            .direct("street")
            .build()
            .unwrap();
        assert!(d.is_aggregate());
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let err = EntityDescriptor::builder("Employee")
            .primary_key(["id"])
            .direct("id")
            .direct("id")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_writable_heterogeneous_collection_rejected() {
        let err = EntityDescriptor::builder("Project")
            .primary_key(["id"])
            .mapping(Arc::new(HeterogeneousCollectionMapping::new("members")))
            .build()
            .unwrap_err();
        match err {
            CoherenceError::InvalidMappingOperation {
                mapping, operation, ..
            } => {
                assert_eq!(mapping, "members");
                assert_eq!(operation, "compare_for_change");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_only_heterogeneous_collection_accepted() {
        let d = EntityDescriptor::builder("Project")
            .primary_key(["id"])
            .mapping(Arc::new(
                HeterogeneousCollectionMapping::new("members").read_only(),
            ))
            .build()
            .unwrap();
        assert!(d.mapping("members").unwrap().as_cascadable().is_some());
    }

    #[test]
    fn test_sequenced_requires_single_key() {
        let err = EntityDescriptor::builder("LineItem")
            .primary_key(["order", "line"])
            .sequenced()
            .build()
            .unwrap_err();
        assert!(matches!(err, CoherenceError::InvalidInput { .. }));
    }

    #[test]
    fn test_populate_clone_remaps_mapped_references_only() {
        let d = employee();
        let boss = coherence_core::ObjectId::next();
        let boss_clone = coherence_core::ObjectId::next();
        let mut original = Attributes::new();
        original.insert("id".into(), Value::Int(1));
        original.insert("manager".into(), Value::Ref(boss));
        original.insert("version".into(), Value::Int(3));

        let clone = d
            .populate_attributes_for_clone(&original, &mut |id| {
                assert_eq!(id, boss);
                Ok(boss_clone)
            })
            .unwrap();
        assert_eq!(clone["manager"], Value::Ref(boss_clone));
        assert_eq!(clone["version"], Value::Int(3));
    }

    #[test]
    fn test_registry_describe() {
        let mut registry = DescriptorRegistry::new();
        registry.register(employee());
        assert!(registry.describe(&EntityType::new("Employee")).is_ok());
        let err = registry.describe(&EntityType::new("Dept")).unwrap_err();
        assert!(matches!(err, CoherenceError::DescriptorNotFound { .. }));
        assert_eq!(registry.entities(), vec![EntityType::new("Employee")]);
    }
}
