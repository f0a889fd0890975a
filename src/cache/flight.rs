//! Per-key single-flight coordination.
//!
//! At most one computation runs per key; callers that arrive while one is
//! in flight await its outcome instead of starting their own. Slots hold no
//! locks across the computation itself.

use std::collections::HashMap;

use tokio::sync::broadcast;

use super::lock::RecoverableMutex;

/// Single-flight group over string keys.
///
/// `T` is the shared outcome; it must be cheap to clone because every
/// waiter receives a copy.
pub struct FlightGroup<T: Clone + Send + 'static> {
    slots: RecoverableMutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            slots: RecoverableMutex::new("flight.slots", HashMap::new()),
        }
    }

    /// Number of in-flight computations, for observability.
    pub fn in_flight(&self) -> usize {
        self.slots.lock("in_flight").len()
    }

    /// Run `work` under the key's slot, or await the current holder.
    ///
    /// Returns the outcome plus whether this caller was the leader (the one
    /// that actually ran `work`). If a leader is cancelled mid-flight its
    /// waiters retry for the slot, so no caller is stranded.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let mut work = Some(work);
        loop {
            match self.join_or_lead(key) {
                Slot::Waiter(mut receiver) => match receiver.recv().await {
                    Ok(outcome) => return (outcome, false),
                    // Leader vanished without a result; compete for the slot.
                    Err(_) => continue,
                },
                Slot::Leader => {
                    // Leader path. The guard clears the slot even if the
                    // computation panics or the future is dropped, which
                    // releases any waiters to retry.
                    let guard = SlotGuard { group: self, key };
                    let work = work.take().expect("leader role is taken at most once");
                    let outcome = work().await;

                    let sender = self.complete(key);
                    std::mem::forget(guard);
                    if let Some(sender) = sender {
                        let _ = sender.send(outcome.clone());
                    }
                    return (outcome, true);
                }
            }
        }
    }

    /// Synchronous slot lookup/registration. Kept non-async so the mutex
    /// guard can never be held across an await point.
    fn join_or_lead(&self, key: &str) -> Slot<T> {
        let mut slots = self.slots.lock("run");
        match slots.get(key) {
            Some(sender) => Slot::Waiter(sender.subscribe()),
            None => {
                let (sender, _) = broadcast::channel(1);
                slots.insert(key.to_string(), sender);
                Slot::Leader
            }
        }
    }

    fn complete(&self, key: &str) -> Option<broadcast::Sender<T>> {
        let mut slots = self.slots.lock("complete");
        slots.remove(key)
    }
}

enum Slot<T: Clone + Send + 'static> {
    Waiter(broadcast::Receiver<T>),
    Leader,
}

impl<T: Clone + Send + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotGuard<'a, T: Clone + Send + 'static> {
    group: &'a FlightGroup<T>,
    key: &'a str,
}

impl<T: Clone + Send + 'static> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        let mut slots = self.group.slots.lock("guard_drop");
        slots.remove(self.key);
    }
}
