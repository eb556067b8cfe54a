//! Attribute values
//!
//! Every mapped attribute of an entity object holds a [`Value`]. Basic
//! columns use the scalar variants, embedded (aggregate) objects use
//! `Embedded`, and relationships hold object handles (`Ref`, `RefList`)
//! rather than pointers.
//!
//! ## Equality
//!
//! - Different variants are never equal: `Int(1) != Float(1.0)`
//! - Floats use IEEE-754 equality: `NaN != NaN`, `-0.0 == 0.0`
//! - Embedded values compare deeply, attribute by attribute

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::timestamp::Timestamp;
use crate::types::ObjectId;

/// Value of one mapped attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null / unset
    Null,
    /// Boolean column
    Bool(bool),
    /// 64-bit signed integer column
    Int(i64),
    /// 64-bit float column (IEEE-754)
    Float(f64),
    /// Text column
    String(String),
    /// Binary column
    Bytes(Vec<u8>),
    /// Timestamp column
    Timestamp(Timestamp),
    /// Embedded aggregate, owned by its parent and without identity of its own
    Embedded(BTreeMap<String, Value>),
    /// Single-valued relationship
    Ref(ObjectId),
    /// Collection relationship, in collection order
    RefList(Vec<ObjectId>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Embedded(a), Value::Embedded(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::RefList(a), Value::RefList(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Variant name, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Timestamp(_) => "Timestamp",
            Value::Embedded(_) => "Embedded",
            Value::Ref(_) => "Ref",
            Value::RefList(_) => "RefList",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as Timestamp if this is a Timestamp value
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Get the embedded attribute map if this is an Embedded value
    pub fn as_embedded(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Embedded(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// Get the referenced handle if this is a Ref value
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Get the referenced handles if this is a RefList value
    pub fn as_ref_list(&self) -> Option<&[ObjectId]> {
        match self {
            Value::RefList(ids) => Some(ids),
            _ => None,
        }
    }

    /// Every object handle reachable directly from this value
    ///
    /// Embedded values are searched recursively, since an aggregate may
    /// itself hold relationships.
    pub fn referenced_ids(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<ObjectId>) {
        match self {
            Value::Ref(id) => out.push(*id),
            Value::RefList(ids) => out.extend(ids.iter().copied()),
            Value::Embedded(attrs) => {
                for v in attrs.values() {
                    v.collect_ids(out);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}
