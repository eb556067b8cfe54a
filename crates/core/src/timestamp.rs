//! Microsecond timestamps
//!
//! Read times, cache expiry deadlines and timestamp-based lock values are
//! all expressed as microseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch
///
/// Ordered chronologically. Arithmetic saturates instead of wrapping so a
/// pathological time-to-live never produces a deadline in the past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Latest representable instant
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Current wall-clock time
    ///
    /// A clock set before the epoch reads as the epoch.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// From microseconds since epoch
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// From milliseconds since epoch
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    /// From seconds since epoch
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// Microseconds since epoch
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Milliseconds since epoch (truncated)
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Seconds since epoch (truncated)
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Time elapsed from `earlier` to `self`, `None` if `earlier` is later
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_micros)
    }

    /// Add a duration, saturating at [`Timestamp::MAX`]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }

    /// Subtract a duration, saturating at [`Timestamp::EPOCH`]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_sub(micros))
    }

    /// The next representable instant after `self`
    pub fn succ(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }

    /// Strictly earlier than `other`
    pub fn is_before(&self, other: Timestamp) -> bool {
        self.0 < other.0
    }

    /// Strictly later than `other`
    pub fn is_after(&self, other: Timestamp) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

impl From<u64> for Timestamp {
    fn from(micros: u64) -> Self {
        Timestamp(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_epoch() {
        assert!(Timestamp::now().is_after(Timestamp::EPOCH));
    }

    #[test]
    fn test_unit_conversions() {
        let ts = Timestamp::from_secs(3);
        assert_eq!(ts.as_millis(), 3_000);
        assert_eq!(ts.as_micros(), 3_000_000);
        assert_eq!(Timestamp::from_millis(1_500).as_secs(), 1);
    }

    #[test]
    fn test_saturating_arithmetic() {
        let ts = Timestamp::from_micros(10);
        assert_eq!(ts.saturating_sub(Duration::from_secs(1)), Timestamp::EPOCH);
        assert_eq!(Timestamp::MAX.saturating_add(Duration::from_secs(1)), Timestamp::MAX);
        assert_eq!(ts.succ(), Timestamp::from_micros(11));
    }

    #[test]
    fn test_duration_since() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b.duration_since(a), Some(Duration::from_millis(150)));
        assert_eq!(a.duration_since(b), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_micros(1_000_042).to_string(), "1.000042");
    }
}
