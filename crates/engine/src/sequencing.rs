//! Primary-key sequencing for new objects
//!
//! Entities built with [`DescriptorBuilder::sequenced`] get their single
//! key attribute assigned at commit when a new object does not carry one.
//! Counters are per entity, monotonic, and start at the configured
//! `sequence_start`.
//!
//! [`DescriptorBuilder::sequenced`]: crate::descriptor::DescriptorBuilder::sequenced

use coherence_core::{CoherenceResult, EntityObject, EntityType, Value};
use dashmap::DashMap;
use tracing::debug;

use crate::descriptor::EntityDescriptor;

/// Per-entity key counters
#[derive(Debug)]
pub struct Sequencing {
    start: i64,
    next: DashMap<EntityType, i64>,
}

impl Sequencing {
    /// Counters starting at `start`
    pub fn new(start: i64) -> Self {
        Self {
            start,
            next: DashMap::new(),
        }
    }

    /// Take the next value for `entity`
    pub fn next_value(&self, entity: &EntityType) -> i64 {
        let mut slot = self.next.entry(entity.clone()).or_insert(self.start);
        let value = *slot;
        *slot += 1;
        value
    }

    /// Make sure the counter for `entity` does not hand out values below
    /// `at_least`
    pub fn seed(&self, entity: &EntityType, at_least: i64) {
        let mut slot = self.next.entry(entity.clone()).or_insert(self.start);
        if *slot < at_least {
            *slot = at_least;
        }
    }

    /// Assign a key to `object` if its entity is sequenced and the key
    /// attribute is unset
    ///
    /// Returns `true` if a value was assigned. A key set by the caller
    /// seeds the counter past it.
    pub fn assign(&self, descriptor: &EntityDescriptor, object: &EntityObject) -> CoherenceResult<bool> {
        if !descriptor.is_sequenced() {
            return Ok(false);
        }
        let [attribute] = descriptor.primary_key_attributes() else {
            return Ok(false);
        };
        match object.get(attribute) {
            Some(Value::Int(existing)) => {
                self.seed(descriptor.entity(), existing.saturating_add(1));
                Ok(false)
            }
            Some(value) if !value.is_null() => Ok(false),
            _ => {
                let value = self.next_value(descriptor.entity());
                object.set(attribute.clone(), value);
                debug!(target: "coherence::uow", entity = %descriptor.entity(), value, "assigned sequence number");
                Ok(true)
            }
        }
    }
}

impl Default for Sequencing {
    fn default() -> Self {
        Self::new(1)
    }
}
