//! Keyed Lock Manager
//!
//! Serializes work on a single key (a competitive unit id or a distribution id)
//! while letting different keys proceed in parallel.
//!
//! - `acquire()` waits for the key (per-unit settlement passes queue up)
//! - `try_acquire()` fails fast (a distribution already being executed is rejected)
//!
//! Guards are owned, so they can be held across `.await` points and dropped
//! from any task. A key leaves the table when its last holder releases it
//! and nobody is waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Guard returned by the lock manager. The key is released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    table: Arc<LockTable>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Table entry plus the guard's own handle: no waiter cloned the slot
        self.table
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 2);
    }
}

/// Advisory lock table keyed by string id
#[derive(Debug, Default)]
pub struct SettlementLockManager {
    /// One async mutex per key, created lazily
    locks: Arc<LockTable>,
    /// Statistics: total lock acquisitions
    pub total_acquisitions: AtomicU64,
    /// Statistics: try_acquire calls that found the key busy
    pub total_conflicts: AtomicU64,
}

impl SettlementLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        // Clone the Arc out so the DashMap shard lock is not held while waiting
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &str, held: OwnedMutexGuard<()>) -> KeyGuard {
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        KeyGuard {
            key: key.to_string(),
            table: self.locks.clone(),
            _held: held,
        }
    }

    /// Wait until the key is free and take it
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let held = self.slot(key).lock_owned().await;
        self.guard(key, held)
    }

    /// Take the key only if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        match self.slot(key).try_lock_owned() {
            Ok(held) => Some(self.guard(key, held)),
            Err(_) => {
                self.total_conflicts.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether the key is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held or waited on
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Conflict rate of `try_acquire` calls
    pub fn conflict_rate(&self) -> f64 {
        let total = self.total_acquisitions.load(Ordering::Relaxed)
            + self.total_conflicts.load(Ordering::Relaxed);
        let conflicts = self.total_conflicts.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            conflicts as f64 / total as f64
        }
    }
}
