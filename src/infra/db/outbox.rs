use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{OutboxStore, RepoError};
use crate::domain::{OutboxMessage, OutboxMetadata, OutboxStatus};

use super::{map_sqlx_error, PostgresRepositories};

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
    topic: String,
    status: String,
    metadata: Option<serde_json::Value>,
    retry_count: i32,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    next_attempt_at: OffsetDateTime,
    published_at: Option<OffsetDateTime>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = RepoError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = OutboxStatus::try_from(row.status.as_str())
            .map_err(|err| RepoError::from_persistence(err.to_string()))?;
        let metadata = row
            .metadata
            .map(serde_json::from_value::<OutboxMetadata>)
            .transpose()
            .map_err(|err| RepoError::from_persistence(format!("bad outbox metadata: {err}")))?;

        Ok(Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            topic: row.topic,
            status,
            metadata,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
            next_attempt_at: row.next_attempt_at,
            published_at: row.published_at,
        })
    }
}

/// Stage an outbox message inside a transaction the caller owns.
///
/// This is the only way rows enter the outbox: the co-written business data
/// and the message commit or roll back together.
pub(super) async fn save_outbox_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    message: &OutboxMessage,
) -> Result<(), RepoError> {
    let metadata = message
        .metadata
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| RepoError::from_persistence(format!("bad outbox metadata: {err}")))?;

    sqlx::query(
        "INSERT INTO outbox_messages (id, aggregate_type, aggregate_id, event_type, payload, \
         topic, status, partition_key, metadata, retry_count, created_at, next_attempt_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(message.id)
    .bind(&message.aggregate_type)
    .bind(&message.aggregate_id)
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(&message.topic)
    .bind(message.status.as_str())
    .bind(message.partition_key())
    .bind(metadata)
    .bind(message.retry_count)
    .bind(message.created_at)
    .bind(message.next_attempt_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresRepositories {
    async fn fetch_pending(
        &self,
        limit: u32,
        partition_index: u32,
        partition_count: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        let lease_until = OffsetDateTime::now_utc() + lease;
        let rows = sqlx::query_as::<_, OutboxRow>(
            "WITH due AS ( \
                SELECT id FROM outbox_messages \
                 WHERE status = 'pending' \
                   AND next_attempt_at <= now() \
                   AND ($3 <= 1 OR partition_key % $3 = $4) \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE outbox_messages o \
                SET next_attempt_at = $2 \
               FROM due \
              WHERE o.id = due.id \
             RETURNING o.id, o.aggregate_type, o.aggregate_id, o.event_type, o.payload, \
                       o.topic, o.status, o.metadata, o.retry_count, o.error_message, \
                       o.created_at, o.next_attempt_at, o.published_at",
        )
        .bind(limit as i64)
        .bind(lease_until)
        .bind(partition_count as i32)
        .bind(partition_index as i32)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut messages = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order; restore FIFO here.
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
                SET status = 'published', published_at = now() \
              WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE outbox_messages \
                SET retry_count = retry_count + 1, error_message = $2, next_attempt_at = $3 \
              WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE outbox_messages \
                SET status = 'failed', error_message = $2 \
              WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn cleanup_published(&self, retention: Duration) -> Result<u64, RepoError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let result = sqlx::query(
            "DELETE FROM outbox_messages \
              WHERE status = 'published' AND published_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64, RepoError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM outbox_messages WHERE status = 'pending'")
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        Ok(count.max(0) as u64)
    }
}
