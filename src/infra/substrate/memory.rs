//! In-memory substrate for tests and offline runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{glob_match, PubSubMessage, Subscription, Substrate, SubstrateError};

const SUBSCRIPTION_BUFFER: usize = 1024;

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

struct Subscriber {
    pattern: String,
    sender: mpsc::Sender<PubSubMessage>,
}

/// Open scan positions, keyed by cursor token. Anchoring the cursor to the
/// last key walked (rather than an index) keeps the iteration stable when
/// the caller deletes matched keys between steps, which is exactly what
/// batched pattern invalidation does.
#[derive(Default)]
struct ScanCursors {
    next_token: u64,
    positions: HashMap<u64, String>,
}

/// Substrate backed by process-local maps. TTLs are honored lazily on
/// access; pub/sub delivery is immediate and in-process.
#[derive(Default)]
pub struct MemorySubstrate {
    entries: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    cursors: Mutex<ScanCursors>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys, for test assertions.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("memory substrate entries lock")
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, for test assertions on jitter bounds.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().expect("memory substrate entries lock");
        let entry = entries.get(key)?;
        let now = Instant::now();
        if entry.expires_at <= now {
            return None;
        }
        Some(entry.expires_at - now)
    }

    fn prune(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SubstrateError> {
        let entries = self.entries.lock().expect("memory substrate entries lock");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SubstrateError> {
        let mut entries = self.entries.lock().expect("memory substrate entries lock");
        entries.insert(
            key.to_string(),
            Entry {
                value: Bytes::copy_from_slice(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, SubstrateError> {
        let mut entries = self.entries.lock().expect("memory substrate entries lock");
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), SubstrateError> {
        let after = if cursor == 0 {
            None
        } else {
            let mut cursors = self.cursors.lock().expect("memory substrate cursor lock");
            cursors.positions.remove(&cursor)
        };

        let mut entries = self.entries.lock().expect("memory substrate entries lock");
        Self::prune(&mut entries);

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();

        let mut walked = 0usize;
        let mut matched = Vec::new();
        let mut last_walked: Option<String> = None;
        for key in keys
            .iter()
            .filter(|key| after.as_ref().map_or(true, |from| key.as_str() > from.as_str()))
        {
            if walked >= count.max(1) {
                // More keys remain; hand out a token anchored to the last
                // key this step walked.
                let mut cursors = self.cursors.lock().expect("memory substrate cursor lock");
                cursors.next_token += 1;
                let token = cursors.next_token;
                if let Some(anchor) = last_walked {
                    cursors.positions.insert(token, anchor);
                    return Ok((token, matched));
                }
                return Ok((0, matched));
            }
            walked += 1;
            last_walked = Some((*key).clone());
            if glob_match(pattern, key) {
                matched.push((*key).clone());
            }
        }

        Ok((0, matched))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SubstrateError> {
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("memory substrate subscribers lock");
        subscribers.retain(|sub| {
            if !glob_match(&sub.pattern, channel) {
                return true;
            }
            // A closed receiver unsubscribes; a full buffer drops the
            // message, matching pub/sub fire-and-forget semantics.
            !matches!(
                sub.sender.try_send(message.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
        Ok(())
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription, SubstrateError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .expect("memory substrate subscribers lock")
            .push(Subscriber {
                pattern: pattern.to_string(),
                sender,
            });
        Ok(Subscription::new(receiver))
    }

    async fn ping(&self) -> Result<(), SubstrateError> {
        Ok(())
    }
}
