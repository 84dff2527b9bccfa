//! Per-key async mutual exclusion.
//!
//! [`KeyedLock`] maps arbitrary string keys to a fair tokio mutex. Waiters on
//! the same key are served in FIFO order; different keys never block each
//! other. The map entry is dropped as soon as the last holder or waiter for a
//! key goes away, so the map only ever contains keys that are in use.
//!
//! The indexer uses `index:<origin>` keys to run at most one indexing pass
//! per source, and tables use `write:<record url>` keys to serialize
//! read-modify-write cycles on one record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLock {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Dropping the guard releases it.
    pub async fn acquire(&self, key: &str) -> KeyedLockGuard {
        let (slot, slot_ref) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            let slot_ref = SlotRef {
                slots: Arc::clone(&self.slots),
                key: key.to_string(),
            };
            (slot, slot_ref)
        };
        // slot_ref outlives the wait, so a cancelled waiter still cleans up
        let guard = slot.lock_owned().await;
        KeyedLockGuard {
            _guard: guard,
            _slot: slot_ref,
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock on one key.
pub struct KeyedLockGuard {
    // field order matters: the mutex is released before the slot check
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

/// Drops the map entry for `key` once nobody else references its mutex.
struct SlotRef {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    key: String,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}
