//! Cache invalidation policies and the expiry index
//!
//! A descriptor chooses how long a cached original stays trustworthy after
//! it was last read or written:
//! - `NoExpiry`: until explicitly invalidated
//! - `TimeToLive`: a fixed duration after the entry's read time
//! - `DailyExpiry`: at a fixed wall-clock time (UTC) each day
//!
//! [`ExpiryIndex`] maps expiry deadlines to cache keys so that sweeping
//! expired entries costs O(expired) rather than O(cache size).

use chrono::{TimeZone, Utc};
use coherence_core::{CacheKey, Timestamp};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// How long a cached original stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheInvalidationPolicy {
    /// Valid until explicitly invalidated
    #[default]
    NoExpiry,
    /// Valid for a fixed duration after the read time
    TimeToLive(Duration),
    /// Expires every day at `hour:minute` UTC
    DailyExpiry {
        /// Hour of day, 0-23
        hour: u32,
        /// Minute of hour, 0-59
        minute: u32,
    },
}

impl CacheInvalidationPolicy {
    /// Deadline after which an entry read at `read_time` is stale
    ///
    /// Returns `None` when the policy never expires entries. For
    /// `DailyExpiry` the deadline is the first occurrence of the expiry
    /// time strictly after `read_time`.
    pub fn expiry_after(&self, read_time: Timestamp) -> Option<Timestamp> {
        match self {
            CacheInvalidationPolicy::NoExpiry => None,
            CacheInvalidationPolicy::TimeToLive(ttl) => Some(read_time.saturating_add(*ttl)),
            CacheInvalidationPolicy::DailyExpiry { hour, minute } => {
                next_daily_deadline(read_time, *hour, *minute)
            }
        }
    }

    /// Check whether an entry read at `read_time` is stale at `now`
    pub fn is_expired(&self, read_time: Timestamp, now: Timestamp) -> bool {
        match self.expiry_after(read_time) {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}

fn next_daily_deadline(read_time: Timestamp, hour: u32, minute: u32) -> Option<Timestamp> {
    let secs = i64::try_from(read_time.as_secs()).ok()?;
    let read = Utc.timestamp_opt(secs, 0).single()?;
    let today = read.date_naive().and_hms_opt(hour, minute, 0)?;
    let today = Utc.from_utc_datetime(&today);
    let deadline = if today > read {
        today
    } else {
        today.checked_add_signed(chrono::Duration::days(1))?
    };
    u64::try_from(deadline.timestamp()).ok().map(Timestamp::from_secs)
}

/// Expiry index: deadline → keys expiring at that deadline
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    index: BTreeMap<Timestamp, HashSet<CacheKey>>,
}

impl ExpiryIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` as expiring at `deadline`
    pub fn insert(&mut self, deadline: Timestamp, key: CacheKey) {
        self.index.entry(deadline).or_default().insert(key);
    }

    /// Remove `key` from the given deadline
    ///
    /// Used when an entry is rewritten with a new deadline or removed.
    pub fn remove(&mut self, deadline: Timestamp, key: &CacheKey) {
        if let Some(keys) = self.index.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&deadline);
            }
        }
    }

    /// All keys whose deadline is at or before `now`
    pub fn find_expired(&self, now: Timestamp) -> Vec<(Timestamp, CacheKey)> {
        self.index
            .range(..=now)
            .flat_map(|(ts, keys)| keys.iter().map(move |k| (*ts, k.clone())))
            .collect()
    }

    /// Total number of indexed keys
    pub fn len(&self) -> usize {
        self.index.values().map(|keys| keys.len()).sum()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
