//! Cache entries and write permits
//!
//! A [`CacheEntry`] holds the canonical object for one cache key together
//! with its optimistic-lock value, read time and invalidation state. Reads
//! of the slot are lock-free with respect to writers of other entries and
//! never block on the write permit.
//!
//! ## Write permit
//!
//! [`WritePermit`] admits at most one writing merge at a time. It is owned
//! by a [`MergeToken`], not by a thread: a merge may acquire on one thread
//! and release on another. Acquisition by the current owner nests; each
//! acquire must be matched by one release, and a release by a token that
//! does not own the permit is a no-op returning `false`.

use coherence_core::{CacheKey, EntityObject, MergeToken, Timestamp, WriteLockValue};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PermitState {
    owner: Option<MergeToken>,
    depth: u32,
}

/// Single-writer permit owned by a merge token
#[derive(Debug, Default)]
pub struct WritePermit {
    state: Mutex<PermitState>,
    freed: Condvar,
}

impl WritePermit {
    /// Create a free permit
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without waiting
    ///
    /// Returns `true` if `token` now owns the permit (possibly nested).
    pub fn try_acquire(&self, token: MergeToken) -> bool {
        let mut state = self.state.lock();
        Self::grant(&mut state, token)
    }

    /// Acquire, waiting until the permit is free
    ///
    /// # Arguments
    ///
    /// * `token` - Acquiring merge
    /// * `timeout` - Maximum wait, `None` for unbounded
    ///
    /// Returns `false` if the wait timed out.
    pub fn acquire(&self, token: MergeToken, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if Self::grant(&mut state, token) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.freed.wait_until(&mut state, deadline).timed_out() {
                        return Self::grant(&mut state, token);
                    }
                }
                None => self.freed.wait(&mut state),
            }
        }
    }

    fn grant(state: &mut PermitState, token: MergeToken) -> bool {
        match state.owner {
            None => {
                state.owner = Some(token);
                state.depth = 1;
                true
            }
            Some(owner) if owner == token => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of ownership held by `token`
    ///
    /// Returns `true` if `token` owned the permit. Releasing a permit the
    /// token does not own (including a second release) changes nothing.
    pub fn release(&self, token: MergeToken) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(token) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.freed.notify_all();
        }
        true
    }

    /// Current owner, if held
    pub fn owner(&self) -> Option<MergeToken> {
        self.state.lock().owner
    }

    /// Check if any merge holds the permit
    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

#[derive(Debug)]
pub(crate) struct EntrySlot {
    pub(crate) object: Option<Arc<EntityObject>>,
    pub(crate) write_lock_value: Option<WriteLockValue>,
    pub(crate) read_time: Timestamp,
    pub(crate) invalidated: bool,
    pub(crate) expires_at: Option<Timestamp>,
}

/// Point-in-time view of an entry's slot
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// Canonical object, `None` for an entry created for a pending insert
    pub object: Option<Arc<EntityObject>>,
    /// Optimistic-lock value
    pub write_lock_value: Option<WriteLockValue>,
    /// Last refresh or write
    pub read_time: Timestamp,
    /// Explicitly invalidated
    pub invalidated: bool,
    /// Deadline set by the invalidation policy
    pub expires_at: Option<Timestamp>,
}

/// One identity-map entry
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    pub(crate) slot: RwLock<EntrySlot>,
    permit: WritePermit,
}

impl CacheEntry {
    pub(crate) fn vacant(key: CacheKey) -> Self {
        Self {
            key,
            slot: RwLock::new(EntrySlot {
                object: None,
                write_lock_value: None,
                read_time: Timestamp::EPOCH,
                invalidated: false,
                expires_at: None,
            }),
            permit: WritePermit::new(),
        }
    }

    /// Cache key, immutable for the life of the entry
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Canonical object
    pub fn object(&self) -> Option<Arc<EntityObject>> {
        self.slot.read().object.clone()
    }

    /// Optimistic-lock value
    pub fn write_lock_value(&self) -> Option<WriteLockValue> {
        self.slot.read().write_lock_value
    }

    /// Time of last refresh or write
    pub fn read_time(&self) -> Timestamp {
        self.slot.read().read_time
    }

    /// Check if the entry was explicitly invalidated
    pub fn is_invalidated(&self) -> bool {
        self.slot.read().invalidated
    }

    /// Check if the invalidation policy deadline has passed at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.slot.read().expires_at, Some(deadline) if deadline <= now)
    }

    /// Check if the entry holds no canonical version a merge may diff against
    ///
    /// True when the entry is vacant, invalidated or expired.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        let slot = self.slot.read();
        slot.object.is_none()
            || slot.invalidated
            || matches!(slot.expires_at, Some(deadline) if deadline <= now)
    }

    /// Check if the entry has no object
    pub fn is_vacant(&self) -> bool {
        self.slot.read().object.is_none()
    }

    /// Consistent copy of the slot
    pub fn snapshot(&self) -> EntrySnapshot {
        let slot = self.slot.read();
        EntrySnapshot {
            object: slot.object.clone(),
            write_lock_value: slot.write_lock_value,
            read_time: slot.read_time,
            invalidated: slot.invalidated,
            expires_at: slot.expires_at,
        }
    }

    /// The entry's write permit
    pub fn permit(&self) -> &WritePermit {
        &self.permit
    }

    /// Check if `token` holds the write permit
    pub fn is_held_by(&self, token: MergeToken) -> bool {
        self.permit.owner() == Some(token)
    }
}
