//! Event log: durable, at-least-once append of serialized events.
//!
//! The relay appends through [`EventLog`]; the cache updater reads through
//! [`EventLogConsumer`]. Records are keyed so downstream consumers can
//! deduplicate; acknowledgement is explicit, so a crash between handling
//! and ack replays the record.

mod memory;
mod stream;

pub use memory::{MemoryEventLog, MemoryLogConsumer};
pub use stream::{StreamConsumer, StreamEventLog};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log connection failed: {0}")]
    Connection(String),
    #[error("event log append failed: {0}")]
    Append(String),
    #[error("event log read failed: {0}")]
    Read(String),
}

impl From<redis::RedisError> for EventLogError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Append(err.to_string())
        }
    }
}

/// One record read back from a topic.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    /// Log-assigned position, used for acknowledgement.
    pub entry_id: String,
    /// Producer-supplied key (message id); consumers deduplicate on it.
    pub key: String,
    pub payload: Bytes,
}

/// Append-only publisher onto named topics.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a payload under a key. At-least-once: callers may retry and
    /// produce duplicates; the key is the dedup handle.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), EventLogError>;

    /// Liveness probe for health aggregation.
    async fn ping(&self) -> Result<(), EventLogError>;
}

/// Group-based reader over one or more topics.
#[async_trait]
pub trait EventLogConsumer: Send + Sync {
    /// Fetch up to `max` unacknowledged records, waiting up to `block_ms`
    /// for new ones. An empty result means the wait timed out.
    async fn poll(&self, max: usize, block_ms: u64) -> Result<Vec<LogRecord>, EventLogError>;

    /// Acknowledge a handled record so it is not redelivered.
    async fn ack(&self, record: &LogRecord) -> Result<(), EventLogError>;
}
