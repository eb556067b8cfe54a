//! Multi-threaded tests for the identity map
//!
//! 1. **Single writer** - a permit is never held by two merges at once
//! 2. **Atomic install** - readers never observe a half-written object
//! 3. **Disjoint keys** - writers on different keys do not serialize

use coherence_cache::{AcquireMode, IdentityMap};
use coherence_core::{
    Attributes, CacheKey, EntityObject, MergeToken, PrimaryKey, Timestamp, Value, WriteLockValue,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn key(id: i64) -> CacheKey {
    CacheKey::new("Account", PrimaryKey::int(id))
}

fn seed(map: &IdentityMap, k: &CacheKey, balance: i64) {
    let token = MergeToken::next();
    let entry = map.acquire_for_write(k, token, AcquireMode::NoWait).unwrap();
    let mut attrs = Attributes::new();
    attrs.insert("balance".into(), Value::Int(balance));
    attrs.insert("mirror".into(), Value::Int(balance));
    map.install(
        &entry,
        token,
        EntityObject::new("Account", attrs),
        Some(WriteLockValue::Version(1)),
        Timestamp::now(),
    )
    .unwrap();
    map.release(&entry, token);
}

// ============================================================================
// SECTION 1: Single writer
// ============================================================================

mod single_writer {
    use super::*;

    #[test]
    fn test_permit_never_shared() {
        let map = Arc::new(IdentityMap::new());
        seed(&map, &key(1), 0);
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let inside = Arc::clone(&inside);
                let violations = Arc::clone(&violations);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let token = MergeToken::next();
                        let entry = map
                            .acquire_for_write(&key(1), token, AcquireMode::Wait(None))
                            .unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert!(map.release(&entry, token));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(!map.lookup_entry(&key(1)).unwrap().permit().is_held());
    }

    #[test]
    fn test_concurrent_insert_of_same_key_yields_one_entry() {
        let map = Arc::new(IdentityMap::new());
        let barrier = Arc::new(Barrier::new(4));
        let installed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                let installed = Arc::clone(&installed);
                thread::spawn(move || {
                    barrier.wait();
                    let token = MergeToken::next();
                    let entry = map
                        .acquire_for_write(&key(7), token, AcquireMode::Wait(None))
                        .unwrap();
                    if entry.is_vacant() {
                        map.install(
                            &entry,
                            token,
                            EntityObject::empty("Account"),
                            Some(WriteLockValue::Version(1)),
                            Timestamp::now(),
                        )
                        .unwrap();
                        installed.fetch_add(1, Ordering::SeqCst);
                    }
                    map.release(&entry, token);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(installed.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);
    }
}

// ============================================================================
// SECTION 2: Atomic install
// ============================================================================

mod atomic_install {
    use super::*;

    #[test]
    fn test_readers_never_see_torn_state() {
        let map = Arc::new(IdentityMap::new());
        seed(&map, &key(1), 0);
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while !stop.load(Ordering::Relaxed) {
                    let token = MergeToken::next();
                    let entry = map
                        .acquire_for_write(&key(1), token, AcquireMode::Wait(None))
                        .unwrap();
                    let obj = entry.object().unwrap();
                    let n: i64 = rng.gen_range(0..1_000_000);
                    let mut next = obj.snapshot();
                    next.insert("balance".into(), Value::Int(n));
                    next.insert("mirror".into(), Value::Int(n));
                    obj.replace_state(next);
                    map.record_write(&entry, token, None, Timestamp::now()).unwrap();
                    map.release(&entry, token);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let obj = map.lookup(&key(1)).unwrap();
                        let state = obj.snapshot();
                        assert_eq!(state.get("balance"), state.get("mirror"));
                    }
                })
            })
            .collect();

        for r in readers {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}

// ============================================================================
// SECTION 3: Disjoint keys
// ============================================================================

mod disjoint_keys {
    use super::*;

    #[test]
    fn test_holding_one_key_does_not_block_another() {
        let map = Arc::new(IdentityMap::new());
        seed(&map, &key(1), 0);
        seed(&map, &key(2), 0);

        let holder = MergeToken::next();
        let held = map
            .acquire_for_write(&key(1), holder, AcquireMode::NoWait)
            .unwrap();

        let other = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let token = MergeToken::next();
                let entry = map
                    .acquire_for_write(
                        &key(2),
                        token,
                        AcquireMode::Wait(Some(Duration::from_secs(5))),
                    )
                    .unwrap();
                map.release(&entry, token)
            })
        };

        assert!(other.join().unwrap());
        assert!(map.release(&held, holder));
    }
}
