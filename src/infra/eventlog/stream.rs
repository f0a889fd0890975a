//! Event log carried on substrate streams.
//!
//! Topics are streams; consumer groups give each reader cohort its own
//! cursor with explicit acknowledgement, which preserves the at-least-once
//! contract across consumer crashes.

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::{EventLog, EventLogConsumer, EventLogError, LogRecord};

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";

/// Publisher appending with XADD.
pub struct StreamEventLog {
    manager: ConnectionManager,
}

impl StreamEventLog {
    pub async fn connect(url: &str) -> Result<Self, EventLogError> {
        let client = Client::open(url).map_err(EventLogError::from)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(EventLogError::from)?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventLog for StreamEventLog {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), EventLogError> {
        let mut conn = self.manager.clone();
        redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(key)
            .arg(FIELD_PAYLOAD)
            .arg(payload)
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), EventLogError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

/// Consumer-group reader over a fixed set of topics.
pub struct StreamConsumer {
    manager: Mutex<ConnectionManager>,
    topics: Vec<String>,
    group: String,
    consumer_name: String,
}

impl StreamConsumer {
    /// Join (creating if necessary) a consumer group on each topic.
    pub async fn join(
        url: &str,
        topics: Vec<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, EventLogError> {
        let client = Client::open(url).map_err(EventLogError::from)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(EventLogError::from)?;
        let consumer = Self {
            manager: Mutex::new(manager),
            topics,
            group: group.into(),
            consumer_name: consumer_name.into(),
        };
        consumer.ensure_groups().await?;
        Ok(consumer)
    }

    async fn ensure_groups(&self) -> Result<(), EventLogError> {
        let mut conn = self.manager.lock().await;
        for topic in &self.topics {
            let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(topic)
                .arg(&self.group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut *conn)
                .await;
            match created {
                Ok(()) => debug!(topic = %topic, group = %self.group, "Created consumer group"),
                // A group that already exists is fine.
                Err(err) if err.to_string().contains("BUSYGROUP") => {}
                Err(err) => return Err(EventLogError::from(err)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventLogConsumer for StreamConsumer {
    async fn poll(&self, max: usize, block_ms: u64) -> Result<Vec<LogRecord>, EventLogError> {
        let ids: Vec<&str> = self.topics.iter().map(|_| ">").collect();
        let mut conn = self.manager.lock().await;
        // A timed-out BLOCK answers nil, not an empty reply.
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(max.max(1))
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.topics)
            .arg(&ids)
            .query_async(&mut *conn)
            .await
            .map_err(|err| EventLogError::Read(err.to_string()))?;
        drop(conn);

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let key = entry
                    .get::<String>(FIELD_KEY)
                    .unwrap_or_else(|| entry.id.clone());
                let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).unwrap_or_default();
                records.push(LogRecord {
                    topic: stream_key.key.clone(),
                    entry_id: entry.id.clone(),
                    key,
                    payload: Bytes::from(payload),
                });
            }
        }
        Ok(records)
    }

    async fn ack(&self, record: &LogRecord) -> Result<(), EventLogError> {
        let mut conn = self.manager.lock().await;
        redis::cmd("XACK")
            .arg(&record.topic)
            .arg(&self.group)
            .arg(&record.entry_id)
            .query_async::<u64>(&mut *conn)
            .await
            .map_err(|err| EventLogError::Read(err.to_string()))?;
        Ok(())
    }
}
