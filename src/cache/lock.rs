//! Poison-tolerant shared state.
//!
//! A panic while holding one of these locks must not wedge its subsystem:
//! a poisoned flight table would strand every waiter on that key forever,
//! and a poisoned room map would silently stop all local fan-out. Both
//! callers tolerate the weaker guarantee — flight slots are re-claimed by
//! the next caller and room membership is re-read on every frame — so
//! recovery trades strict consistency for availability. Each recovery is
//! counted and logged with the owning site so a panicking writer shows up
//! in the metrics instead of only in one log line.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::counter;
use tracing::warn;

const METRIC_LOCK_RECOVERIES: &str = "staffetta_lock_poison_recoveries_total";

fn note_recovery(site: &'static str, op: &'static str, kind: &'static str) {
    counter!(METRIC_LOCK_RECOVERIES, "site" => site).increment(1);
    warn!(
        site,
        op,
        lock = kind,
        "Recovered from poisoned lock; state may lag the panicked writer"
    );
}

/// Reader-writer lock that recovers from poisoning.
///
/// `site` names the owning structure (for example `hub.rooms`) and shows
/// up on every recovery metric and log line; `op` narrows it to the
/// operation that hit the poisoned guard.
pub(crate) struct RecoverableRwLock<T> {
    site: &'static str,
    inner: RwLock<T>,
}

impl<T> RecoverableRwLock<T> {
    pub(crate) fn new(site: &'static str, value: T) -> Self {
        Self {
            site,
            inner: RwLock::new(value),
        }
    }

    pub(crate) fn read(&self, op: &'static str) -> RwLockReadGuard<'_, T> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                note_recovery(self.site, op, "rwlock.read");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, T> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                note_recovery(self.site, op, "rwlock.write");
                poisoned.into_inner()
            }
        }
    }
}

/// Mutex flavor for exclusively-held tables like the flight slot map.
pub(crate) struct RecoverableMutex<T> {
    site: &'static str,
    inner: Mutex<T>,
}

impl<T> RecoverableMutex<T> {
    pub(crate) fn new(site: &'static str, value: T) -> Self {
        Self {
            site,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self, op: &'static str) -> MutexGuard<'_, T> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                note_recovery(self.site, op, "mutex");
                poisoned.into_inner()
            }
        }
    }
}
