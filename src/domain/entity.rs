//! Entity read model records.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One row of the authoritative read model the cache loads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub payload: serde_json::Value,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Page of entities for list queries, cursor-less (offset-bounded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPage {
    pub items: Vec<EntityRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}
