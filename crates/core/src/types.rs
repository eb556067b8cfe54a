//! Identity types for the persistence runtime
//!
//! This module defines the keys every other layer is addressed by:
//! - EntityType: name of a mapped entity class
//! - KeyPart / PrimaryKey: ordered primary-key tuple
//! - CacheKey: (entity type, primary key), the identity-map key
//! - ObjectId: stable handle of an in-flight object
//! - MergeToken: owner of the write permits acquired by one merge
//! - SessionId: identity of a session, tags distributed change sets

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::value::Value;

/// Name of a mapped entity type
///
/// Entity types are compared by name. Two descriptors with the same name
/// describe the same identity space in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityType(String);

impl EntityType {
    /// Create an entity type from its name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Entity name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One scalar component of a primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPart {
    /// Integer column
    Int(i64),
    /// Text column
    Text(String),
    /// Binary column (UUIDs, hashes)
    Bytes(Vec<u8>),
}

impl KeyPart {
    /// Convert an attribute value into a key component
    ///
    /// Returns `None` for values that cannot take part in identity
    /// (null, floats, references, embedded values).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(KeyPart::Int(*i)),
            Value::String(s) => Some(KeyPart::Text(s.clone())),
            Value::Bytes(b) => Some(KeyPart::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Convert back into an attribute value
    pub fn to_value(&self) -> Value {
        match self {
            KeyPart::Int(i) => Value::Int(*i),
            KeyPart::Text(s) => Value::String(s.clone()),
            KeyPart::Bytes(b) => Value::Bytes(b.clone()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Text(s) => write!(f, "{:?}", s),
            KeyPart::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
        }
    }
}

/// Ordered primary-key tuple
///
/// Immutable once assigned to a cache entry. Most entities use a single
/// column, so the parts are kept inline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(SmallVec<[KeyPart; 2]>);

impl PrimaryKey {
    /// Build a key from its parts
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// Single integer column key
    pub fn int(id: i64) -> Self {
        Self::new([KeyPart::Int(id)])
    }

    /// Single text column key
    pub fn text(id: impl Into<String>) -> Self {
        Self::new([KeyPart::Text(id.into())])
    }

    /// Key components in column order
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Number of key columns
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty tuple
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join(", "))
    }
}

/// Identity-map key: entity type plus primary key
///
/// Ordering is by entity name, then key. Lock acquisition in key order
/// relies on this being a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Entity type
    pub entity: EntityType,
    /// Primary key within the entity type
    pub key: PrimaryKey,
}

impl CacheKey {
    /// Create a cache key
    pub fn new(entity: impl Into<EntityType>, key: PrimaryKey) -> Self {
        Self {
            entity: entity.into(),
            key,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, self.key)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MERGE_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Stable handle of an in-flight object
///
/// Handles are allocated from a process-wide counter when an object is
/// constructed and never reused. Object references inside attribute values
/// are handles, so identity never depends on pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh handle
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw handle value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owner of the write permits acquired by one merge
///
/// Lock bookkeeping is keyed by token rather than by thread, so a merge
/// handed across threads still releases exactly what it acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeToken(u64);

impl MergeToken {
    /// Allocate a fresh token
    pub fn next() -> Self {
        Self(NEXT_MERGE_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MergeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge-{}", self.0)
    }
}

/// Unique identifier of a session
///
/// A wrapper around a UUID v4. Distributed change sets carry the id of the
/// session that produced them so a peer can ignore its own echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random SessionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a SessionId from its string form
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_cache_key_ordering_is_entity_then_key() {
        let a = CacheKey::new("Address", PrimaryKey::int(9));
        let b = CacheKey::new("Employee", PrimaryKey::int(1));
        let c = CacheKey::new("Employee", PrimaryKey::int(2));
        let mut keys = vec![c.clone(), a.clone(), b.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }

    #[test]
    fn test_key_part_from_value() {
        assert_eq!(KeyPart::from_value(&Value::Int(4)), Some(KeyPart::Int(4)));
        assert_eq!(
            KeyPart::from_value(&Value::String("x".into())),
            Some(KeyPart::Text("x".into()))
        );
        assert_eq!(KeyPart::from_value(&Value::Null), None);
        assert_eq!(KeyPart::from_value(&Value::Float(1.0)), None);
    }

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new(
            "Order",
            PrimaryKey::new([KeyPart::Int(7), KeyPart::Text("eu".into())]),
        );
        assert_eq!(key.to_string(), "Order[7, \"eu\"]");
    }

    #[test]
    fn test_cache_key_json_shape() {
        let key = CacheKey::new("Employee", PrimaryKey::int(1));
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["entity"], serde_json::json!("Employee"));
        let back: CacheKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    proptest::proptest! {
        #[test]
        fn prop_cache_key_order_follows_entity_then_id(
            e1 in "[A-C]", e2 in "[A-C]", k1 in -50i64..50, k2 in -50i64..50
        ) {
            let a = CacheKey::new(e1.as_str(), PrimaryKey::int(k1));
            let b = CacheKey::new(e2.as_str(), PrimaryKey::int(k2));
            let expected = e1.cmp(&e2).then(k1.cmp(&k2));
            proptest::prop_assert_eq!(a.cmp(&b), expected);
        }
    }

    #[test]
    fn test_session_id_roundtrip_string() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_string(&id.to_string()), Some(id));
        assert!(SessionId::from_string("not-a-uuid").is_none());
    }
}
