//! In-memory stores for tests and offline runs.
//!
//! One mutex guards all tables, so every multi-table operation is atomic
//! the way a database transaction would be: an injected failure part-way
//! through leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    CommandStore, EntityStore, OutboxStore, RepoError, SubmitOutcome,
};
use crate::domain::{
    Command, CommandStatus, EntityPage, EntityRecord, ErrorDetail, OutboxMessage, OutboxStatus,
};

#[derive(Default)]
struct State {
    commands: HashMap<Uuid, Command>,
    outbox: HashMap<Uuid, OutboxMessage>,
    idempotency: HashMap<String, (Uuid, OffsetDateTime)>,
    entities: BTreeMap<String, EntityRecord>,
}

/// Memory-backed implementation of all three store traits.
#[derive(Default)]
pub struct MemoryStores {
    state: Mutex<State>,
    fail_outbox_insert: AtomicBool,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next outbox staging fail, aborting the whole transaction.
    pub fn set_fail_outbox_insert(&self, fail: bool) {
        self.fail_outbox_insert.store(fail, Ordering::SeqCst);
    }

    /// Outbox rows in creation order, any status. Test-observable.
    pub fn outbox_rows(&self) -> Vec<OutboxMessage> {
        let state = self.lock();
        let mut rows: Vec<OutboxMessage> = state.outbox.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    pub fn command_count(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn insert_entity(&self, record: EntityRecord) {
        self.lock().entities.insert(record.id.clone(), record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stage_outbox(&self, state: &mut State, message: &OutboxMessage) -> Result<(), RepoError> {
        if self.fail_outbox_insert.swap(false, Ordering::SeqCst) {
            return Err(RepoError::from_persistence("injected outbox insert failure"));
        }
        state.outbox.insert(message.id, message.clone());
        Ok(())
    }

    fn replay_for_key(state: &State, key: &str) -> Option<SubmitOutcome> {
        let (command_id, expires_at) = state.idempotency.get(key)?;
        if *expires_at <= OffsetDateTime::now_utc() {
            return None;
        }
        let status = state
            .commands
            .get(command_id)
            .map(|cmd| cmd.status)
            .unwrap_or(CommandStatus::Pending);
        Some(SubmitOutcome::Replayed {
            command_id: *command_id,
            status,
        })
    }
}

#[async_trait]
impl CommandStore for MemoryStores {
    async fn submit(
        &self,
        command: &Command,
        outbox: &OutboxMessage,
        idempotency_ttl: Duration,
    ) -> Result<SubmitOutcome, RepoError> {
        let mut state = self.lock();

        if let Some(key) = command.idempotency_key.as_deref() {
            if let Some(outcome) = Self::replay_for_key(&state, key) {
                return Ok(outcome);
            }
        }

        // All inserts happen under one lock; an error before the end leaves
        // the maps untouched, mirroring a rolled-back transaction.
        self.stage_outbox(&mut state, outbox)?;
        state.commands.insert(command.id, command.clone());
        if let Some(key) = command.idempotency_key.clone() {
            state.idempotency.insert(
                key,
                (command.id, OffsetDateTime::now_utc() + idempotency_ttl),
            );
        }

        Ok(SubmitOutcome::Accepted {
            command_id: command.id,
        })
    }

    async fn find_command(&self, id: Uuid) -> Result<Option<Command>, RepoError> {
        Ok(self.lock().commands.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), RepoError> {
        let mut state = self.lock();
        let command = state.commands.get_mut(&id).ok_or(RepoError::NotFound)?;
        if !matches!(
            command.status,
            CommandStatus::Pending | CommandStatus::Retrying
        ) {
            return Err(RepoError::conflict(format!(
                "command {id} is not in a runnable state"
            )));
        }
        command.status = CommandStatus::Processing;
        command.processed_at = Some(OffsetDateTime::now_utc());
        command.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn complete_command(&self, id: Uuid) -> Result<(), RepoError> {
        let mut state = self.lock();
        let command = state.commands.get_mut(&id).ok_or(RepoError::NotFound)?;
        if command.status == CommandStatus::Processing {
            command.status = CommandStatus::Completed;
            command.completed_at = Some(OffsetDateTime::now_utc());
            command.updated_at = OffsetDateTime::now_utc();
            command.error = None;
        }
        Ok(())
    }

    async fn fail_command(
        &self,
        id: Uuid,
        error: &ErrorDetail,
        reschedule_at: Option<OffsetDateTime>,
    ) -> Result<(), RepoError> {
        let mut state = self.lock();
        let command = state.commands.get_mut(&id).ok_or(RepoError::NotFound)?;
        if command.status != CommandStatus::Processing {
            return Ok(());
        }
        command.error = Some(error.clone());
        command.updated_at = OffsetDateTime::now_utc();
        match reschedule_at {
            Some(at) => {
                command.status = CommandStatus::Retrying;
                command.retry_count += 1;
                command.scheduled_for = Some(at);
            }
            None => {
                command.status = CommandStatus::Failed;
                command.completed_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn due_retries(&self, limit: u32) -> Result<Vec<Command>, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();
        let mut due: Vec<Uuid> = state
            .commands
            .values()
            .filter(|cmd| {
                cmd.status == CommandStatus::Retrying
                    && cmd.scheduled_for.is_some_and(|at| at <= now)
            })
            .map(|cmd| cmd.id)
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(command) = state.commands.get_mut(&id) {
                command.status = CommandStatus::Pending;
                command.updated_at = now;
                claimed.push(command.clone());
            }
        }
        Ok(claimed)
    }

    async fn expire_idempotency_keys(&self) -> Result<u64, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, (_, expires)| *expires > now);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl OutboxStore for MemoryStores {
    async fn fetch_pending(
        &self,
        limit: u32,
        partition_index: u32,
        partition_count: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();

        let mut due: Vec<Uuid> = state
            .outbox
            .values()
            .filter(|msg| msg.status == OutboxStatus::Pending && msg.next_attempt_at <= now)
            .filter(|msg| {
                partition_count <= 1
                    || (msg.partition_key() as u32) % partition_count == partition_index
            })
            .map(|msg| msg.id)
            .collect();
        due.sort_by_key(|id| {
            let msg = &state.outbox[id];
            (msg.created_at, msg.id)
        });
        due.truncate(limit as usize);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(msg) = state.outbox.get_mut(&id) {
                msg.next_attempt_at = now + lease;
                leased.push(msg.clone());
            }
        }
        Ok(leased)
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), RepoError> {
        let mut state = self.lock();
        let message = state.outbox.get_mut(&id).ok_or(RepoError::NotFound)?;
        if message.status != OutboxStatus::Pending {
            return Err(RepoError::NotFound);
        }
        message.status = OutboxStatus::Published;
        message.published_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let mut state = self.lock();
        if let Some(message) = state.outbox.get_mut(&id) {
            if message.status == OutboxStatus::Pending {
                message.retry_count += 1;
                message.error_message = Some(error.to_string());
                message.next_attempt_at = next_attempt_at;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepoError> {
        let mut state = self.lock();
        if let Some(message) = state.outbox.get_mut(&id) {
            if message.status == OutboxStatus::Pending {
                message.status = OutboxStatus::Failed;
                message.error_message = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn cleanup_published(&self, retention: Duration) -> Result<u64, RepoError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut state = self.lock();
        let before = state.outbox.len();
        state.outbox.retain(|_, msg| {
            !(msg.status == OutboxStatus::Published
                && msg.published_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn pending_count(&self) -> Result<u64, RepoError> {
        let state = self.lock();
        Ok(state
            .outbox
            .values()
            .filter(|msg| msg.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

#[async_trait]
impl EntityStore for MemoryStores {
    async fn find_entity(&self, id: &str) -> Result<Option<EntityRecord>, RepoError> {
        Ok(self.lock().entities.get(id).cloned())
    }

    async fn list_entities(&self, limit: u32, offset: u64) -> Result<EntityPage, RepoError> {
        let limit = limit.clamp(1, 200);
        let state = self.lock();
        let mut all: Vec<&EntityRecord> = state.entities.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let items = all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(EntityPage {
            items,
            total: state.entities.len() as u64,
            limit,
            offset,
        })
    }

    async fn upsert_entity(
        &self,
        id: &str,
        payload: &serde_json::Value,
        outbox: &OutboxMessage,
    ) -> Result<EntityRecord, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();
        self.stage_outbox(&mut state, outbox)?;

        let record = match state.entities.get(id) {
            Some(existing) => EntityRecord {
                id: id.to_string(),
                payload: payload.clone(),
                version: existing.version + 1,
                created_at: existing.created_at,
                updated_at: now,
            },
            None => EntityRecord {
                id: id.to_string(),
                payload: payload.clone(),
                version: 1,
                created_at: now,
                updated_at: now,
            },
        };
        state.entities.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn delete_entity(&self, id: &str, outbox: &OutboxMessage) -> Result<bool, RepoError> {
        let mut state = self.lock();
        if !state.entities.contains_key(id) {
            return Ok(false);
        }
        self.stage_outbox(&mut state, outbox)?;
        state.entities.remove(id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_with_key(key: &str) -> Command {
        Command::new("entity.create", "e-1", json!({"name": "a"})).with_idempotency_key(key)
    }

    fn outbox_for(cmd: &Command) -> OutboxMessage {
        OutboxMessage::new(
            "command",
            cmd.entity_id.clone(),
            cmd.command_type.clone(),
            cmd.payload.clone(),
            "entity.commands",
        )
    }

    #[tokio::test]
    async fn submit_then_replay_same_key() {
        let stores = MemoryStores::new();
        let cmd = command_with_key("k1");
        let first = stores
            .submit(&cmd, &outbox_for(&cmd), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(first, SubmitOutcome::Accepted { .. }));

        let second_cmd = command_with_key("k1");
        let second = stores
            .submit(&second_cmd, &outbox_for(&second_cmd), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second.command_id(), first.command_id());
        assert!(matches!(second, SubmitOutcome::Replayed { .. }));

        assert_eq!(stores.command_count(), 1);
        assert_eq!(stores.outbox_rows().len(), 1);
    }

    #[tokio::test]
    async fn injected_outbox_failure_rolls_back_everything() {
        let stores = MemoryStores::new();
        stores.set_fail_outbox_insert(true);

        let cmd = command_with_key("k2");
        let result = stores
            .submit(&cmd, &outbox_for(&cmd), Duration::from_secs(60))
            .await;
        assert!(result.is_err());
        assert_eq!(stores.command_count(), 0);
        assert!(stores.outbox_rows().is_empty());

        // The failure is one-shot; a retry goes through.
        let retry = stores
            .submit(&cmd, &outbox_for(&cmd), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(retry, SubmitOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn fetch_pending_leases_rows() {
        let stores = MemoryStores::new();
        let cmd = Command::new("entity.update", "e-5", json!({}));
        stores
            .submit(&cmd, &outbox_for(&cmd), Duration::from_secs(60))
            .await
            .unwrap();

        let first = stores
            .fetch_pending(10, 0, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Leased: a second fetch inside the lease window sees nothing.
        let second = stores
            .fetch_pending(10, 0, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_empty());

        stores.mark_published(first[0].id).await.unwrap();
        assert_eq!(stores.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entity_upsert_bumps_version() {
        let stores = MemoryStores::new();
        let msg = OutboxMessage::new("entity", "e-1", "entity.created", json!({}), "entity.events");
        let v1 = stores
            .upsert_entity("e-1", &json!({"n": 1}), &msg)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let msg2 =
            OutboxMessage::new("entity", "e-1", "entity.updated", json!({}), "entity.events");
        let v2 = stores
            .upsert_entity("e-1", &json!({"n": 2}), &msg2)
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(stores.outbox_rows().len(), 2);
    }
}
