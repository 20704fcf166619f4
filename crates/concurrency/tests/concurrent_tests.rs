//! Concurrent/Multi-threaded Tests for snapvault-concurrency
//!
//! These tests exercise `LockRegistry` under real thread interleavings:
//!
//! 1. **Mutual Exclusion** - One holder per identifier at any time
//! 2. **Independence** - Unrelated identifiers never block each other
//! 3. **Wakeup** - Waiters proceed once the holder releases
//! 4. **Interruption** - Shutdown ends waits with a distinguishable error
//! 5. **Reclamation** - No slots are left behind after heavy churn
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrent_tests
//! ```

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use snapvault_concurrency::{LockError, LockRegistry};

// ============================================================================
// SECTION 1: Mutual Exclusion
// ============================================================================

mod mutual_exclusion {
    use super::*;

    #[test]
    fn test_single_holder_per_identifier() {
        let registry = Arc::new(LockRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let _guard = registry.acquire("vol-1").unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(registry.tracked_count(), 0);
    }
}

// ============================================================================
// SECTION 2: Independence
// ============================================================================

mod independence {
    use super::*;

    #[test]
    fn test_unrelated_identifiers_proceed_in_parallel() {
        let registry = Arc::new(LockRegistry::new());
        let barrier = Arc::new(Barrier::new(2));

        // Both threads must be inside their critical sections at the same
        // time to pass the barrier; contention would deadlock the test.
        let handles: Vec<_> = ["vol-1", "vol-2"]
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let _guard = registry
                        .acquire_timeout(id, Duration::from_secs(5))
                        .unwrap();
                    barrier.wait();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}

// ============================================================================
// SECTION 3: Wakeup
// ============================================================================

mod wakeup {
    use super::*;

    #[test]
    fn test_waiter_acquires_after_release() {
        let registry = Arc::new(LockRegistry::new());
        let (held_tx, held_rx) = mpsc::channel();

        let holder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let _guard = registry.acquire("snap-1").unwrap();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };

        held_rx.recv().unwrap();
        let guard = registry.acquire_timeout("snap-1", Duration::from_secs(5));
        assert!(guard.is_ok());
        drop(guard);
        holder.join().unwrap();
        assert_eq!(registry.tracked_count(), 0);
    }

    #[test]
    fn test_timeout_while_held() {
        let registry = Arc::new(LockRegistry::with_default_timeout(Duration::from_millis(30)));
        let _guard = registry.acquire("vol-1").unwrap();

        let registry_clone = Arc::clone(&registry);
        let result = thread::spawn(move || registry_clone.acquire("vol-1").map(|_| ()))
            .join()
            .unwrap();

        match result {
            Err(LockError::TimedOut { resource_id, waited_ms }) => {
                assert_eq!(resource_id, "vol-1");
                assert!(waited_ms >= 30);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}

// ============================================================================
// SECTION 4: Interruption
// ============================================================================

mod interruption {
    use super::*;

    #[test]
    fn test_shutdown_interrupts_waiter() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.acquire("vol-1").unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.acquire("vol-1").map(|_| ()))
        };

        thread::sleep(Duration::from_millis(30));
        registry.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(LockError::Interrupted { .. })));

        drop(guard);
        assert_eq!(registry.tracked_count(), 0);
    }
}

// ============================================================================
// SECTION 5: Reclamation
// ============================================================================

mod reclamation {
    use super::*;

    #[test]
    fn test_heavy_churn_leaves_no_slots() {
        let registry = Arc::new(LockRegistry::new());
        let ids = ["vol-1", "vol-2", "snap-1", "snap-2"];

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..200 {
                        let id = ids[(t + i) % ids.len()];
                        let _guard = registry.acquire(id).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.tracked_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_tracked_count_matches_held_guards(ops in prop::collection::vec((0u8..4, any::<bool>()), 0..64)) {
            let registry = LockRegistry::new();
            let mut held = HashMap::new();

            for (id, take) in ops {
                let name = format!("res-{}", id);
                if take {
                    if !held.contains_key(&id) {
                        held.insert(id, registry.try_acquire(&name).unwrap());
                    }
                } else {
                    held.remove(&id);
                }
                prop_assert_eq!(registry.tracked_count(), held.len());
            }

            held.clear();
            prop_assert_eq!(registry.tracked_count(), 0);
        }
    }
}
