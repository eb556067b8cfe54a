//! Optimistic locking policies
//!
//! A descriptor with optimistic locking names a version attribute and a
//! [`WriteLockPolicy`] that knows how to compare and advance the values
//! stored in it. The merge engine never interprets a [`WriteLockValue`]
//! directly; it asks the policy.
//!
//! ## Policies
//!
//! - [`VersionLockingPolicy`]: integer versions, `next = current + 1`
//! - [`TimestampLockingPolicy`]: last-write timestamps; `next` is the
//!   later of the wall clock and `current + 1µs`, so a writer whose clock
//!   lags the previous writer still produces a strictly newer value

use coherence_core::{Attributes, Timestamp, WriteLockValue};
use std::cmp::Ordering;
use std::fmt;

/// Comparator and generator for optimistic-lock values
pub trait WriteLockPolicy: Send + Sync + fmt::Debug {
    /// Policy name, for diagnostics
    fn name(&self) -> &'static str;

    /// Attribute that stores the lock value on the object
    fn attribute(&self) -> &str;

    /// Value a freshly registered object may carry
    ///
    /// A new object carrying a value newer than this was built from state
    /// that was already merged somewhere.
    fn base_value(&self) -> WriteLockValue;

    /// Value to write after `current`
    fn next_value(&self, current: Option<WriteLockValue>) -> WriteLockValue;

    /// Total order on lock values
    ///
    /// Values of a kind the policy does not produce order before values
    /// of its own kind.
    fn compare(&self, a: &WriteLockValue, b: &WriteLockValue) -> Ordering;

    /// Read the lock value out of an object's attribute state
    fn extract(&self, state: &Attributes) -> Option<WriteLockValue> {
        state
            .get(self.attribute())
            .and_then(WriteLockValue::from_value)
    }

    /// Check if `a` is strictly newer than `b`
    fn is_newer(&self, a: &WriteLockValue, b: &WriteLockValue) -> bool {
        self.compare(a, b) == Ordering::Greater
    }

    /// Check if `value` is newer than [`WriteLockPolicy::base_value`]
    fn is_newer_than_base(&self, value: &WriteLockValue) -> bool {
        self.is_newer(value, &self.base_value())
    }

    /// Compare two optional values; absent orders before present
    fn compare_optional(
        &self,
        a: Option<&WriteLockValue>,
        b: Option<&WriteLockValue>,
    ) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => self.compare(a, b),
        }
    }
}

/// Integer version locking
#[derive(Debug, Clone)]
pub struct VersionLockingPolicy {
    attribute: String,
}

impl VersionLockingPolicy {
    /// Policy storing the version in `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl WriteLockPolicy for VersionLockingPolicy {
    fn name(&self) -> &'static str {
        "version"
    }

    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn base_value(&self) -> WriteLockValue {
        WriteLockValue::Version(0)
    }

    fn next_value(&self, current: Option<WriteLockValue>) -> WriteLockValue {
        match current {
            Some(WriteLockValue::Version(v)) => WriteLockValue::Version(v.saturating_add(1)),
            _ => WriteLockValue::Version(1),
        }
    }

    fn compare(&self, a: &WriteLockValue, b: &WriteLockValue) -> Ordering {
        match (a, b) {
            (WriteLockValue::Version(a), WriteLockValue::Version(b)) => a.cmp(b),
            (WriteLockValue::Version(_), _) => Ordering::Greater,
            (_, WriteLockValue::Version(_)) => Ordering::Less,
            (WriteLockValue::Timestamp(a), WriteLockValue::Timestamp(b)) => a.cmp(b),
        }
    }
}

/// Timestamp locking
#[derive(Debug, Clone)]
pub struct TimestampLockingPolicy {
    attribute: String,
}

impl TimestampLockingPolicy {
    /// Policy storing the last-write timestamp in `attribute`
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl WriteLockPolicy for TimestampLockingPolicy {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn base_value(&self) -> WriteLockValue {
        WriteLockValue::Timestamp(Timestamp::EPOCH)
    }

    fn next_value(&self, current: Option<WriteLockValue>) -> WriteLockValue {
        let now = Timestamp::now();
        match current {
            Some(WriteLockValue::Timestamp(prev)) => WriteLockValue::Timestamp(now.max(prev.succ())),
            _ => WriteLockValue::Timestamp(now),
        }
    }

    fn compare(&self, a: &WriteLockValue, b: &WriteLockValue) -> Ordering {
        match (a, b) {
            (WriteLockValue::Timestamp(a), WriteLockValue::Timestamp(b)) => a.cmp(b),
            (WriteLockValue::Timestamp(_), _) => Ordering::Greater,
            (_, WriteLockValue::Timestamp(_)) => Ordering::Less,
            (WriteLockValue::Version(a), WriteLockValue::Version(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::Value;
    use proptest::prelude::*;

    #[test]
    fn test_version_next_and_compare() {
        let p = VersionLockingPolicy::new("version");
        assert_eq!(p.next_value(None), WriteLockValue::Version(1));
        assert_eq!(
            p.next_value(Some(WriteLockValue::Version(4))),
            WriteLockValue::Version(5)
        );
        assert!(p.is_newer(&WriteLockValue::Version(2), &WriteLockValue::Version(1)));
        assert!(!p.is_newer_than_base(&WriteLockValue::Version(0)));
        assert!(p.is_newer_than_base(&WriteLockValue::Version(1)));
    }

    #[test]
    fn test_timestamp_next_is_strictly_newer_under_skew() {
        let p = TimestampLockingPolicy::new("modified");
        let far_future = Timestamp::MAX.saturating_sub(std::time::Duration::from_secs(1));
        let prev = WriteLockValue::Timestamp(far_future);
        let next = p.next_value(Some(prev));
        assert!(p.is_newer(&next, &prev));
    }

    #[test]
    fn test_extract_reads_attribute() {
        let p = VersionLockingPolicy::new("version");
        let mut attrs = Attributes::new();
        assert_eq!(p.extract(&attrs), None);
        attrs.insert("version".into(), Value::Int(3));
        assert_eq!(p.extract(&attrs), Some(WriteLockValue::Version(3)));
    }

    #[test]
    fn test_compare_optional_absent_first() {
        let p = VersionLockingPolicy::new("version");
        let one = WriteLockValue::Version(1);
        assert_eq!(p.compare_optional(None, Some(&one)), Ordering::Less);
        assert_eq!(p.compare_optional(None, None), Ordering::Equal);
    }

    proptest! {
        #[test]
        fn prop_version_next_always_newer(v in 0u64..u64::MAX) {
            let p = VersionLockingPolicy::new("version");
            let cur = WriteLockValue::Version(v);
            prop_assert!(p.is_newer(&p.next_value(Some(cur)), &cur));
        }

        #[test]
        fn prop_timestamp_next_always_newer(micros in 0u64..(u64::MAX - 1)) {
            let p = TimestampLockingPolicy::new("modified");
            let cur = WriteLockValue::Timestamp(Timestamp::from_micros(micros));
            prop_assert!(p.is_newer(&p.next_value(Some(cur)), &cur));
        }
    }
}
