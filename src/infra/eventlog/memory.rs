//! Recording in-memory event log for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use super::{EventLog, EventLogConsumer, EventLogError, LogRecord};

#[derive(Debug, Clone)]
struct StoredRecord {
    entry_id: u64,
    key: String,
    payload: Bytes,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<StoredRecord>>,
}

/// Append-only log held in process memory. Every published record is
/// retained so tests can assert on the full publication history,
/// duplicates included.
pub struct MemoryEventLog {
    state: Mutex<LogState>,
    sequence: AtomicU64,
    notify: Notify,
    fail_appends: AtomicBool,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            sequence: AtomicU64::new(1),
            notify: Notify::new(),
            fail_appends: AtomicBool::new(false),
        }
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, to exercise relay retry paths.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Every record appended to a topic, in publication order.
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        let state = self.state.lock().expect("memory event log lock");
        state
            .topics
            .get(topic)
            .map(|records| {
                records
                    .iter()
                    .map(|record| LogRecord {
                        topic: topic.to_string(),
                        entry_id: record.entry_id.to_string(),
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys appended to a topic, in order. Duplicates are preserved.
    pub fn keys(&self, topic: &str) -> Vec<String> {
        self.records(topic)
            .into_iter()
            .map(|record| record.key)
            .collect()
    }

    /// Open a consumer over the given topics, starting from the beginning.
    pub fn consumer(self: &Arc<Self>, topics: Vec<String>) -> MemoryLogConsumer {
        MemoryLogConsumer {
            log: Arc::clone(self),
            topics,
            acked: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), EventLogError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(EventLogError::Append("injected append failure".into()));
        }
        let entry_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("memory event log lock");
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(StoredRecord {
                entry_id,
                key: key.to_string(),
                payload: Bytes::copy_from_slice(payload),
            });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ping(&self) -> Result<(), EventLogError> {
        Ok(())
    }
}

/// Cursor-tracking consumer over a [`MemoryEventLog`].
///
/// Delivery is at-least-once: unacked records are returned again on the
/// next poll, mirroring consumer-group redelivery.
pub struct MemoryLogConsumer {
    log: Arc<MemoryEventLog>,
    topics: Vec<String>,
    // Per topic, entry ids already acknowledged.
    acked: Mutex<HashMap<String, u64>>,
}

impl MemoryLogConsumer {
    fn unacked(&self, max: usize) -> Vec<LogRecord> {
        let state = self.log.state.lock().expect("memory event log lock");
        let acked = self.acked.lock().expect("memory consumer ack lock");
        let mut out = Vec::new();
        for topic in &self.topics {
            let floor = acked.get(topic).copied().unwrap_or(0);
            if let Some(records) = state.topics.get(topic) {
                for record in records.iter().filter(|r| r.entry_id > floor) {
                    out.push(LogRecord {
                        topic: topic.clone(),
                        entry_id: record.entry_id.to_string(),
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    });
                    if out.len() >= max {
                        return out;
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl EventLogConsumer for MemoryLogConsumer {
    async fn poll(&self, max: usize, block_ms: u64) -> Result<Vec<LogRecord>, EventLogError> {
        let records = self.unacked(max.max(1));
        if !records.is_empty() || block_ms == 0 {
            return Ok(records);
        }

        let wait = tokio::time::timeout(
            std::time::Duration::from_millis(block_ms),
            self.log.notify.notified(),
        );
        let _ = wait.await;
        Ok(self.unacked(max.max(1)))
    }

    async fn ack(&self, record: &LogRecord) -> Result<(), EventLogError> {
        let entry_id: u64 = record
            .entry_id
            .parse()
            .map_err(|_| EventLogError::Read(format!("bad entry id `{}`", record.entry_id)))?;
        let mut acked = self.acked.lock().expect("memory consumer ack lock");
        let floor = acked.entry(record.topic.clone()).or_insert(0);
        if entry_id > *floor {
            *floor = entry_id;
        }
        Ok(())
    }
}
