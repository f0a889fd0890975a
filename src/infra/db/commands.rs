use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{CommandStore, RepoError, SubmitOutcome};
use crate::domain::{Command, CommandStatus, ErrorDetail, OutboxMessage, Priority};

use super::outbox::save_outbox_in_tx;
use super::{map_sqlx_error, PostgresRepositories};

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: Uuid,
    command_type: String,
    entity_id: String,
    payload: serde_json::Value,
    idempotency_key: Option<String>,
    subject: Option<String>,
    correlation_id: Option<String>,
    status: String,
    priority: i16,
    retry_count: i32,
    max_retries: i32,
    retry_backoff_ms: i64,
    timeout_ms: i64,
    error_code: Option<String>,
    error_message: Option<String>,
    scheduled_for: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<CommandRow> for Command {
    type Error = RepoError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let status = CommandStatus::try_from(row.status.as_str())
            .map_err(|err| RepoError::from_persistence(err.to_string()))?;
        let priority = Priority::try_from(row.priority)
            .map_err(|err| RepoError::from_persistence(err.to_string()))?;

        let error = match (row.error_code, row.error_message) {
            (Some(code), message) => Some(ErrorDetail {
                code,
                message: message.unwrap_or_default(),
                occurred_at: row.updated_at,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            command_type: row.command_type,
            entity_id: row.entity_id,
            payload: row.payload,
            idempotency_key: row.idempotency_key,
            subject: row.subject,
            correlation_id: row.correlation_id,
            status,
            priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            retry_backoff: Duration::from_millis(row.retry_backoff_ms.max(0) as u64),
            timeout: Duration::from_millis(row.timeout_ms.max(0) as u64),
            error,
            scheduled_for: row.scheduled_for,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_COMMAND: &str = "SELECT id, command_type, entity_id, payload, idempotency_key, \
     subject, correlation_id, status, priority, retry_count, max_retries, \
     retry_backoff_ms, timeout_ms, error_code, error_message, scheduled_for, \
     created_at, updated_at, processed_at, completed_at \
     FROM commands";

#[async_trait]
impl CommandStore for PostgresRepositories {
    async fn submit(
        &self,
        command: &Command,
        outbox: &OutboxMessage,
        idempotency_ttl: Duration,
    ) -> Result<SubmitOutcome, RepoError> {
        if let Some(key) = command.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(existing);
            }
        }

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            "INSERT INTO commands (id, command_type, entity_id, payload, idempotency_key, \
             subject, correlation_id, status, priority, retry_count, max_retries, \
             retry_backoff_ms, timeout_ms, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(command.id)
        .bind(&command.command_type)
        .bind(&command.entity_id)
        .bind(&command.payload)
        .bind(command.idempotency_key.as_deref())
        .bind(command.subject.as_deref())
        .bind(command.correlation_id.as_deref())
        .bind(command.status.as_str())
        .bind(command.priority.as_i16())
        .bind(command.retry_count)
        .bind(command.max_retries)
        .bind(command.retry_backoff.as_millis() as i64)
        .bind(command.timeout.as_millis() as i64)
        .bind(command.created_at)
        .bind(command.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        save_outbox_in_tx(&mut tx, outbox).await?;

        if let Some(key) = command.idempotency_key.as_deref() {
            let expires_at = OffsetDateTime::now_utc() + idempotency_ttl;
            let inserted = sqlx::query(
                "INSERT INTO idempotency_keys (key, command_id, created_at, expires_at) \
                 VALUES ($1, $2, now(), $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(command.id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if inserted.rows_affected() == 0 {
                // Lost the race to another writer: roll everything back and
                // surface the winner's command id.
                tx.rollback().await.map_err(map_sqlx_error)?;
                return self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| RepoError::conflict("idempotency key vanished during replay"));
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(SubmitOutcome::Accepted {
            command_id: command.id,
        })
    }

    async fn find_command(&self, id: Uuid) -> Result<Option<Command>, RepoError> {
        let row = sqlx::query_as::<_, CommandRow>(&format!("{SELECT_COMMAND} WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Command::try_from(row).map(Some),
            None => Ok(None),
        }
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE commands \
                SET status = 'processing', processed_at = now(), updated_at = now() \
              WHERE id = $1 AND status IN ('pending', 'retrying')",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::conflict(format!(
                "command {id} is not in a runnable state"
            )));
        }
        Ok(())
    }

    async fn complete_command(&self, id: Uuid) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE commands \
                SET status = 'completed', completed_at = now(), updated_at = now(), \
                    error_code = NULL, error_message = NULL \
              WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fail_command(
        &self,
        id: Uuid,
        error: &ErrorDetail,
        reschedule_at: Option<OffsetDateTime>,
    ) -> Result<(), RepoError> {
        match reschedule_at {
            Some(at) => {
                sqlx::query(
                    "UPDATE commands \
                        SET status = 'retrying', retry_count = retry_count + 1, \
                            scheduled_for = $2, error_code = $3, error_message = $4, \
                            updated_at = now() \
                      WHERE id = $1 AND status = 'processing'",
                )
                .bind(id)
                .bind(at)
                .bind(&error.code)
                .bind(&error.message)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            }
            None => {
                sqlx::query(
                    "UPDATE commands \
                        SET status = 'failed', completed_at = now(), \
                            error_code = $2, error_message = $3, updated_at = now() \
                      WHERE id = $1 AND status = 'processing'",
                )
                .bind(id)
                .bind(&error.code)
                .bind(&error.message)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            }
        }
        Ok(())
    }

    async fn due_retries(&self, limit: u32) -> Result<Vec<Command>, RepoError> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "WITH due AS ( \
                SELECT id FROM commands \
                 WHERE status = 'retrying' AND scheduled_for <= now() \
                 ORDER BY scheduled_for ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE commands c \
                SET status = 'pending', updated_at = now() \
               FROM due \
              WHERE c.id = due.id \
             RETURNING c.id, c.command_type, c.entity_id, c.payload, c.idempotency_key, \
                       c.subject, c.correlation_id, c.status, c.priority, c.retry_count, \
                       c.max_retries, c.retry_backoff_ms, c.timeout_ms, c.error_code, \
                       c.error_message, c.scheduled_for, c.created_at, c.updated_at, \
                       c.processed_at, c.completed_at",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(Command::try_from).collect()
    }

    async fn expire_idempotency_keys(&self) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < now()")
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

impl PostgresRepositories {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<SubmitOutcome>, RepoError> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT c.id, c.status \
               FROM idempotency_keys i \
               JOIN commands c ON c.id = i.command_id \
              WHERE i.key = $1 AND i.expires_at > now()",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some((command_id, status)) => {
                let status = CommandStatus::try_from(status.as_str())
                    .map_err(|err| RepoError::from_persistence(err.to_string()))?;
                Ok(Some(SubmitOutcome::Replayed { command_id, status }))
            }
            None => Ok(None),
        }
    }
}
