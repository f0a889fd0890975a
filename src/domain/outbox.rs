//! Outbox message model.
//!
//! An outbox message is staged in the same transaction as the business
//! write it describes and drained asynchronously by the relay. Status is
//! monotonic: a published row never returns to pending.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;

/// Relay-visible status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for OutboxStatus {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!(
                "unknown outbox status `{other}`"
            ))),
        }
    }
}

/// Typed envelope metadata plus an opaque bag.
///
/// `cache_tags` drive pattern invalidation in the cache updater; everything
/// else rides along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboxMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_tags: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OutboxMetadata {
    pub fn with_cache_tags(tags: Vec<String>) -> Self {
        Self {
            cache_tags: tags,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache_tags.is_empty() && self.extra.is_empty()
    }
}

/// A durable message staged for publication onto the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub status: OutboxStatus,
    pub metadata: Option<OutboxMetadata>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
}

impl OutboxMessage {
    /// Stage a pending message for the given aggregate.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        topic: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            topic: topic.into(),
            status: OutboxStatus::Pending,
            metadata: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            next_attempt_at: now,
            published_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: OutboxMetadata) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }

    /// The partition a message belongs to when relays shard by aggregate.
    ///
    /// Uses a stable FNV-1a over `aggregate_type:aggregate_id` so every
    /// relay instance computes the same assignment.
    pub fn partition(&self, partition_count: u32) -> u32 {
        aggregate_partition(&self.aggregate_type, &self.aggregate_id, partition_count)
    }

    /// Virtual partition stored with the row; relay instances filter on
    /// `partition_key % instance_count` so any instance count divides the
    /// key space without rehashing.
    pub fn partition_key(&self) -> i32 {
        self.partition(VIRTUAL_PARTITIONS) as i32
    }
}

/// Fixed virtual-partition count for stored partition keys.
pub const VIRTUAL_PARTITIONS: u32 = 1024;

/// Stable hash-partition assignment for an aggregate.
pub fn aggregate_partition(aggregate_type: &str, aggregate_id: &str, partition_count: u32) -> u32 {
    if partition_count <= 1 {
        return 0;
    }
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x100_0000_01b3;
    let mut hash = OFFSET;
    for byte in aggregate_type
        .as_bytes()
        .iter()
        .chain(b":")
        .chain(aggregate_id.as_bytes())
    {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    (hash % u64::from(partition_count)) as u32
}
