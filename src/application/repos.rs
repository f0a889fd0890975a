//! Store traits the application services depend on.
//!
//! Postgres implementations live in `infra::db`; in-memory implementations
//! back the tests and offline runs.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{Command, CommandStatus, EntityPage, EntityRecord, ErrorDetail, OutboxMessage};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence failure: {message}")]
    Persistence { message: String },
    #[error("conflicting write: {message}")]
    Conflict { message: String },
    #[error("record not found")]
    NotFound,
}

impl RepoError {
    pub fn from_persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

/// Result of an idempotent submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The command and its outbox row were persisted in one transaction.
    Accepted { command_id: Uuid },
    /// The idempotency key was already mapped; nothing was written.
    Replayed {
        command_id: Uuid,
        status: CommandStatus,
    },
}

impl SubmitOutcome {
    pub fn command_id(&self) -> Uuid {
        match self {
            Self::Accepted { command_id } | Self::Replayed { command_id, .. } => *command_id,
        }
    }
}

/// Command rows plus the idempotency mapping that shares their transaction.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Persist the command, its outbox message, and (when present on the
    /// command) the idempotency mapping in ONE transaction. If the key is
    /// already mapped, nothing is written and the prior command id returns.
    async fn submit(
        &self,
        command: &Command,
        outbox: &OutboxMessage,
        idempotency_ttl: Duration,
    ) -> Result<SubmitOutcome, RepoError>;

    async fn find_command(&self, id: Uuid) -> Result<Option<Command>, RepoError>;

    /// pending/retrying → processing, stamping `processed_at`.
    async fn mark_processing(&self, id: Uuid) -> Result<(), RepoError>;

    /// processing → completed, stamping `completed_at`.
    async fn complete_command(&self, id: Uuid) -> Result<(), RepoError>;

    /// processing → retrying (when `reschedule_at` is set) or terminal
    /// failed. Retry count increments either way.
    async fn fail_command(
        &self,
        id: Uuid,
        error: &ErrorDetail,
        reschedule_at: Option<OffsetDateTime>,
    ) -> Result<(), RepoError>;

    /// Claim retrying commands whose `scheduled_for` has passed, flipping
    /// them back to pending. The claim is exclusive across schedulers.
    async fn due_retries(&self, limit: u32) -> Result<Vec<Command>, RepoError>;

    /// Drop idempotency mappings past their expiry; returns rows removed.
    async fn expire_idempotency_keys(&self) -> Result<u64, RepoError>;
}

/// Durable outbox rows: the relay is the only reader of pending messages.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` due pending messages for this relay partition,
    /// FIFO by creation time. Leased rows are invisible to other relay
    /// instances until `lease` elapses, so a crashed relay's batch becomes
    /// eligible again (at-least-once).
    async fn fetch_pending(
        &self,
        limit: u32,
        partition_index: u32,
        partition_count: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, RepoError>;

    /// pending → published, stamping the publish time.
    async fn mark_published(&self, id: Uuid) -> Result<(), RepoError>;

    /// Keep the row pending for a later attempt: bump the retry count,
    /// record the error, and gate on `next_attempt_at`.
    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), RepoError>;

    /// Terminal failure; the row is retained for inspection.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepoError>;

    /// Delete published rows older than the retention window.
    async fn cleanup_published(&self, retention: Duration) -> Result<u64, RepoError>;

    /// Pending backlog size, exposed through health and metrics.
    async fn pending_count(&self) -> Result<u64, RepoError>;
}

/// The entity read model plus the outbox rows co-written with it.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_entity(&self, id: &str) -> Result<Option<EntityRecord>, RepoError>;

    async fn list_entities(&self, limit: u32, offset: u64) -> Result<EntityPage, RepoError>;

    /// Insert or update the entity and stage the outbox message in one
    /// transaction.
    async fn upsert_entity(
        &self,
        id: &str,
        payload: &serde_json::Value,
        outbox: &OutboxMessage,
    ) -> Result<EntityRecord, RepoError>;

    /// Delete the entity and stage the outbox message in one transaction.
    /// Returns false when the entity did not exist (the outbox message is
    /// not staged in that case).
    async fn delete_entity(&self, id: &str, outbox: &OutboxMessage) -> Result<bool, RepoError>;
}
