//! Named resource locks
//!
//! `LockRegistry` hands out exclusive locks keyed by resource identifier
//! (a volume id or a snapshot id). Locks for different identifiers never
//! contend with each other.
//!
//! ## Lifecycle of a slot
//!
//! ```text
//! acquire(id) ──► slot created or reused, refs += 1 ──► wait until free ──► held
//! release / drop ──► held = false, wake one waiter ──► refs -= 1 ──► removed at 0
//! ```
//!
//! Slots are reference counted so the map only holds identifiers that are
//! currently held or waited on. Reference counts only change while the map
//! shard holding the slot is locked, which makes "remove at zero" race-free
//! against a concurrent `acquire` of the same identifier.
//!
//! A wait ends with `LockError` instead of a lock when its timeout elapses or
//! the registry is shut down.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use snapvault_core::SnapshotError;

/// Why a lock could not be acquired
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The wait exceeded its timeout
    #[error("timed out after {waited_ms}ms waiting for lock on {resource_id}")]
    TimedOut {
        /// Contended identifier
        resource_id: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// The registry was shut down while waiting
    #[error("lock wait on {resource_id} interrupted by shutdown")]
    Interrupted {
        /// Contended identifier
        resource_id: String,
    },

    /// Non-blocking acquire found the lock held
    #[error("lock on {resource_id} is held")]
    WouldBlock {
        /// Contended identifier
        resource_id: String,
    },
}

impl LockError {
    /// Identifier the failed acquire was for
    pub fn resource_id(&self) -> &str {
        match self {
            LockError::TimedOut { resource_id, .. }
            | LockError::Interrupted { resource_id }
            | LockError::WouldBlock { resource_id } => resource_id,
        }
    }
}

impl From<LockError> for SnapshotError {
    fn from(e: LockError) -> Self {
        SnapshotError::LockAcquisitionFailed {
            resource_id: e.resource_id().to_string(),
            reason: e.to_string(),
        }
    }
}

struct LockSlot {
    held: Mutex<bool>,
    released: Condvar,
    /// Holders plus waiters. Only modified under the owning map shard lock.
    refs: AtomicUsize,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            refs: AtomicUsize::new(0),
        }
    }
}

/// Registry of exclusive locks keyed by resource identifier
///
/// One registry is created by the service and shared (via `Arc`) by every
/// pipeline that must coordinate on volumes and snapshots.
pub struct LockRegistry {
    slots: DashMap<String, Arc<LockSlot>>,
    default_timeout: Option<Duration>,
    shutdown: AtomicBool,
}

impl LockRegistry {
    /// Create a registry whose `acquire` waits indefinitely
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            default_timeout: None,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create a registry whose `acquire` gives up after `timeout`
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Acquire the lock for `resource_id` using the registry's default timeout
    pub fn acquire(&self, resource_id: &str) -> Result<ResourceGuard<'_>, LockError> {
        self.acquire_for(resource_id, self.default_timeout)
    }

    /// Acquire the lock, giving up after `timeout`
    pub fn acquire_timeout(
        &self,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<ResourceGuard<'_>, LockError> {
        self.acquire_for(resource_id, Some(timeout))
    }

    /// Acquire the lock if it is free right now
    pub fn try_acquire(&self, resource_id: &str) -> Result<ResourceGuard<'_>, LockError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(LockError::Interrupted {
                resource_id: resource_id.to_string(),
            });
        }
        let slot = self.checkout(resource_id);
        let acquired = {
            let mut held = slot.held.lock();
            if *held {
                false
            } else {
                *held = true;
                true
            }
        };
        if acquired {
            trace!(target: "snapvault::lock", resource_id, "Lock acquired");
            Ok(ResourceGuard::new(self, resource_id, slot))
        } else {
            self.checkin(resource_id);
            Err(LockError::WouldBlock {
                resource_id: resource_id.to_string(),
            })
        }
    }

    /// Acquire the lock, waiting at most `timeout` (`None` = indefinitely)
    ///
    /// # Errors
    ///
    /// - `LockError::TimedOut` if the lock stayed held for the whole timeout
    /// - `LockError::Interrupted` if the registry was shut down
    pub fn acquire_for(
        &self,
        resource_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ResourceGuard<'_>, LockError> {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let slot = self.checkout(resource_id);

        let outcome = {
            let mut held = slot.held.lock();
            if *held {
                debug!(target: "snapvault::lock", resource_id, "Lock contended, waiting");
            }
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    break Err(LockError::Interrupted {
                        resource_id: resource_id.to_string(),
                    });
                }
                if !*held {
                    *held = true;
                    break Ok(());
                }
                match deadline {
                    Some(deadline) => {
                        if slot.released.wait_until(&mut held, deadline).timed_out() && *held {
                            break Err(LockError::TimedOut {
                                resource_id: resource_id.to_string(),
                                waited_ms: u64::try_from(start.elapsed().as_millis())
                                    .unwrap_or(u64::MAX),
                            });
                        }
                    }
                    None => slot.released.wait(&mut held),
                }
            }
        };

        match outcome {
            Ok(()) => {
                trace!(target: "snapvault::lock", resource_id, "Lock acquired");
                Ok(ResourceGuard::new(self, resource_id, slot))
            }
            Err(e) => {
                warn!(target: "snapvault::lock", resource_id, error = %e, "Lock acquisition failed");
                self.checkin(resource_id);
                Err(e)
            }
        }
    }

    /// Check whether `resource_id` is currently held
    pub fn is_locked(&self, resource_id: &str) -> bool {
        match self.slots.get(resource_id) {
            Some(slot) => {
                let held = *slot.held.lock();
                held
            }
            None => false,
        }
    }

    /// Number of identifiers currently held or waited on
    pub fn tracked_count(&self) -> usize {
        self.slots.len()
    }

    /// Interrupt every waiter and refuse future acquisitions
    ///
    /// Locks already held stay held until their guards are released.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for entry in self.slots.iter() {
            // Taking the slot mutex orders the flag store before the waiter's re-check.
            let _held = entry.value().held.lock();
            entry.value().released.notify_all();
        }
        debug!(target: "snapvault::lock", "Lock registry shut down");
    }

    /// True once `shutdown` was called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn checkout(&self, resource_id: &str) -> Arc<LockSlot> {
        let entry = self
            .slots
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(LockSlot::new()));
        entry.value().refs.fetch_add(1, Ordering::SeqCst);
        Arc::clone(entry.value())
    }

    fn checkin(&self, resource_id: &str) {
        self.slots
            .remove_if(resource_id, |_, slot| slot.refs.fetch_sub(1, Ordering::SeqCst) == 1);
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("tracked", &self.slots.len())
            .field("default_timeout", &self.default_timeout)
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}

/// Exclusive hold on one resource identifier
///
/// Released on drop. `release` may be called explicitly; later calls and the
/// drop are then no-ops.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ResourceGuard<'a> {
    registry: &'a LockRegistry,
    resource_id: String,
    slot: Arc<LockSlot>,
    released: bool,
}

impl<'a> ResourceGuard<'a> {
    fn new(registry: &'a LockRegistry, resource_id: &str, slot: Arc<LockSlot>) -> Self {
        Self {
            registry,
            resource_id: resource_id.to_string(),
            slot,
            released: false,
        }
    }

    /// Identifier this guard holds
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Release the lock now
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut held = self.slot.held.lock();
            *held = false;
            self.slot.released.notify_one();
        }
        self.registry.checkin(&self.resource_id);
        trace!(target: "snapvault::lock", resource_id = %self.resource_id, "Lock released");
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ResourceGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource_id", &self.resource_id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let registry = LockRegistry::new();
        let guard = registry.acquire("vol-1").unwrap();
        assert!(registry.is_locked("vol-1"));
        assert_eq!(guard.resource_id(), "vol-1");
        drop(guard);
        assert!(!registry.is_locked("vol-1"));
    }

    #[test]
    fn test_slot_reclaimed_after_release() {
        let registry = LockRegistry::new();
        {
            let _a = registry.acquire("vol-1").unwrap();
            let _b = registry.acquire("snap-1").unwrap();
            assert_eq!(registry.tracked_count(), 2);
        }
        assert_eq!(registry.tracked_count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = LockRegistry::new();
        let mut guard = registry.acquire("vol-1").unwrap();
        guard.release();
        guard.release();
        assert!(!registry.is_locked("vol-1"));
        drop(guard);
        assert_eq!(registry.tracked_count(), 0);

        // The identifier can be taken again
        let _again = registry.try_acquire("vol-1").unwrap();
    }

    #[test]
    fn test_try_acquire_would_block() {
        let registry = LockRegistry::new();
        let _held = registry.acquire("snap-1").unwrap();
        let err = registry.try_acquire("snap-1").unwrap_err();
        assert!(matches!(err, LockError::WouldBlock { .. }));
        // The failed attempt does not leak a reference
        drop(_held);
        assert_eq!(registry.tracked_count(), 0);
    }

    #[test]
    fn test_unrelated_ids_do_not_contend() {
        let registry = LockRegistry::new();
        let _a = registry.acquire("vol-1").unwrap();
        let b = registry.try_acquire("vol-2");
        assert!(b.is_ok());
    }

    #[test]
    fn test_timeout_reports_acquisition_failure() {
        let registry = LockRegistry::new();
        let _held = registry.acquire("vol-1").unwrap();
        let err = registry
            .acquire_timeout("vol-1", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, LockError::TimedOut { .. }));

        let snapshot_err: SnapshotError = err.into();
        assert!(matches!(
            snapshot_err,
            SnapshotError::LockAcquisitionFailed { ref resource_id, .. } if resource_id == "vol-1"
        ));
    }

    #[test]
    fn test_shutdown_refuses_new_acquisitions() {
        let registry = LockRegistry::new();
        registry.shutdown();
        assert!(matches!(
            registry.acquire("vol-1"),
            Err(LockError::Interrupted { .. })
        ));
        assert!(matches!(
            registry.try_acquire("vol-1"),
            Err(LockError::Interrupted { .. })
        ));
        assert_eq!(registry.tracked_count(), 0);
    }
}
