//! Keyed mutual exclusion with entry reclamation.
//!
//! A key is present in the table only while someone holds it or waits for it;
//! the last one out removes the entry.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::errors::{FleetError, Result};

#[derive(Debug, Default)]
struct Slot {
    held: bool,
    waiters: usize,
}

/// Lock table keyed by `K`.
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Slot>>,
    released: Condvar,
    timeout: Duration,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquire the lock for `key`, waiting at most the configured timeout.
    pub fn lock(&self, key: &K) -> Result<KeyedGuard<'_, K>> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut table = self.table.lock();

        let slot = table.entry(key.clone()).or_default();
        if !slot.held {
            slot.held = true;
            return Ok(KeyedGuard {
                owner: self,
                key: key.clone(),
            });
        }
        slot.waiters += 1;

        loop {
            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();
            let slot = table.entry(key.clone()).or_default();
            if !slot.held {
                slot.held = true;
                slot.waiters = slot.waiters.saturating_sub(1);
                return Ok(KeyedGuard {
                    owner: self,
                    key: key.clone(),
                });
            }
            if timed_out {
                slot.waiters = slot.waiters.saturating_sub(1);
                return Err(FleetError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Keys currently held or waited on.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.table.lock().len()
    }

    fn release(&self, key: &K) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(key) {
            slot.held = false;
            if slot.waiters == 0 {
                table.remove(key);
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

/// Held lock for one key. Dropping it releases the key.
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    owner: &'a KeyedLocks<K>,
    key: K,
}

impl<K> KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}
