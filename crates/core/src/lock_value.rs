//! Optimistic-lock values
//!
//! A cache entry and an object change set each carry an opaque
//! [`WriteLockValue`]. Ordering between two values is decided by the
//! descriptor's locking policy, not by this type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timestamp::Timestamp;
use crate::value::Value;

/// Version token stored in a cache entry and carried by change sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteLockValue {
    /// Monotonic version number
    Version(u64),
    /// Last-write timestamp
    Timestamp(Timestamp),
}

impl WriteLockValue {
    /// Read a lock value out of the attribute that stores it
    ///
    /// Returns `None` for null or for a value of an unexpected kind.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) if *v >= 0 => Some(WriteLockValue::Version(*v as u64)),
            Value::Timestamp(ts) => Some(WriteLockValue::Timestamp(*ts)),
            _ => None,
        }
    }

    /// Value to store in the version attribute of the object
    pub fn to_value(&self) -> Value {
        match self {
            WriteLockValue::Version(v) => Value::Int(*v as i64),
            WriteLockValue::Timestamp(ts) => Value::Timestamp(*ts),
        }
    }

    /// Version number, if this is a version lock value
    pub fn as_version(&self) -> Option<u64> {
        match self {
            WriteLockValue::Version(v) => Some(*v),
            WriteLockValue::Timestamp(_) => None,
        }
    }

    /// Timestamp, if this is a timestamp lock value
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            WriteLockValue::Timestamp(ts) => Some(*ts),
            WriteLockValue::Version(_) => None,
        }
    }
}

impl fmt::Display for WriteLockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteLockValue::Version(v) => write!(f, "v{}", v),
            WriteLockValue::Timestamp(ts) => write!(f, "@{}", ts),
        }
    }
}
