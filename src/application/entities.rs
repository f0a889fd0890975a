//! Entity read service and command handlers.
//!
//! Reads are cache-first over the read model; writes come in as commands,
//! mutate the read model, and stage their change events in the same
//! transaction.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::instrument;

use crate::cache::{keys, CacheEngine, CacheError, CacheStatus, Fetched};
use crate::domain::{
    ChangeAction, ChangeEvent, Command, EntityPage, OutboxMessage, OutboxMetadata, TOPIC_EVENTS,
};
use crate::infra::breaker::{BreakerConfig, CircuitBreaker};

use super::error::AppError;
use super::ingress::extract_cache_tags;
use super::repos::EntityStore;
use super::worker::CommandHandler;

const ORIGIN_SERVICE: &str = "read-model";

/// Cache-first reads over the entity read model.
///
/// Origin fetches run behind a circuit breaker: with the circuit open the
/// loader fails fast and the caller sees SERVICE_UNAVAILABLE instead of
/// piling timeouts onto a struggling store.
pub struct EntityReadService {
    cache: Arc<CacheEngine>,
    store: Arc<dyn EntityStore>,
    breaker: Arc<CircuitBreaker>,
}

impl EntityReadService {
    pub fn new(cache: Arc<CacheEngine>, store: Arc<dyn EntityStore>) -> Self {
        Self::with_breaker(
            cache,
            store,
            Arc::new(CircuitBreaker::new(ORIGIN_SERVICE, BreakerConfig::default())),
        )
    }

    pub fn with_breaker(
        cache: Arc<CacheEngine>,
        store: Arc<dyn EntityStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            cache,
            store,
            breaker,
        }
    }

    /// Fetch one entity's payload, cache-aside with single-flight.
    ///
    /// `Fetched.value == None` means known absent: either the loader just
    /// said so (a negative entry was written) or a negative entry was hit.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Fetched, AppError> {
        let key = keys::entity_key(id);
        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let id = id.to_string();

        let fetched = self
            .cache
            .get_or_fetch(&key, move || async move {
                breaker
                    .acquire()
                    .map_err(|_| CacheError::CircuitOpen(ORIGIN_SERVICE))?;
                let record = match store.find_entity(&id).await {
                    Ok(record) => {
                        breaker.record_success();
                        record
                    }
                    Err(err) => {
                        breaker.record_failure();
                        return Err(CacheError::Loader(err.to_string()));
                    }
                };
                match record {
                    Some(record) => {
                        let body = serde_json::to_vec(&record.payload)
                            .map_err(|err| CacheError::Loader(err.to_string()))?;
                        Ok(Some(Bytes::from(body)))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(fetched)
    }

    /// Paginated list, cached per query hash.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: u32, offset: u64) -> Result<(Bytes, CacheStatus), AppError> {
        let query_hash = keys::hash_query(&(limit, offset));
        let key = keys::entity_list_key(query_hash);
        let store = self.store.clone();
        let breaker = self.breaker.clone();

        let fetched = self
            .cache
            .get_or_fetch(&key, move || async move {
                breaker
                    .acquire()
                    .map_err(|_| CacheError::CircuitOpen(ORIGIN_SERVICE))?;
                let page: EntityPage = match store.list_entities(limit, offset).await {
                    Ok(page) => {
                        breaker.record_success();
                        page
                    }
                    Err(err) => {
                        breaker.record_failure();
                        return Err(CacheError::Loader(err.to_string()));
                    }
                };
                let body = serde_json::to_vec(&page)
                    .map_err(|err| CacheError::Loader(err.to_string()))?;
                Ok(Some(Bytes::from(body)))
            })
            .await?;

        let value = fetched
            .value
            .ok_or_else(|| AppError::unexpected("list loader returned no page"))?;
        Ok((value, fetched.status))
    }
}

/// Executes the entity command family against the read model.
///
/// Each mutation stages its change event in the same transaction, so the
/// relay sees exactly the events whose business writes committed.
pub struct EntityCommandHandler {
    store: Arc<dyn EntityStore>,
}

impl EntityCommandHandler {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    fn event_outbox(event: &ChangeEvent, tags: Vec<String>) -> Result<OutboxMessage, AppError> {
        let mut event = event.clone();
        if !tags.is_empty() {
            event.metadata = Some(OutboxMetadata::with_cache_tags(tags.clone()));
        }
        let payload = serde_json::to_value(&event)
            .map_err(|err| AppError::unexpected(format!("event serialization: {err}")))?;
        let mut message = OutboxMessage::new(
            event.entity_type.clone(),
            event.entity_id.clone(),
            event.event_type(),
            payload,
            TOPIC_EVENTS,
        );
        if !tags.is_empty() {
            message = message.with_metadata(OutboxMetadata::with_cache_tags(tags));
        }
        Ok(message)
    }

    async fn upsert(&self, command: &Command, action: ChangeAction) -> Result<(), AppError> {
        let tags = extract_cache_tags(&command.payload);
        let body = strip_meta(command.payload.clone());

        let event = ChangeEvent::new(
            "entity",
            command.entity_id.clone(),
            action,
            Some(body.clone()),
        );
        let outbox = Self::event_outbox(&event, tags)?;
        self.store
            .upsert_entity(&command.entity_id, &body, &outbox)
            .await?;
        Ok(())
    }

    async fn delete(&self, command: &Command) -> Result<(), AppError> {
        let tags = extract_cache_tags(&command.payload);
        let event = ChangeEvent::new("entity", command.entity_id.clone(), ChangeAction::Deleted, None);
        let outbox = Self::event_outbox(&event, tags)?;

        let existed = self.store.delete_entity(&command.entity_id, &outbox).await?;
        if !existed {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for EntityCommandHandler {
    async fn handle(&self, command: &Command) -> Result<(), AppError> {
        match command.command_type.as_str() {
            "entity.create" => self.upsert(command, ChangeAction::Created).await,
            "entity.update" => self.upsert(command, ChangeAction::Updated).await,
            "entity.delete" => self.delete(command).await,
            other => Err(AppError::validation(format!(
                "entity handler cannot execute `{other}`"
            ))),
        }
    }
}

/// Remove the metadata slot the ingress folded into the payload.
fn strip_meta(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.remove("_meta");
            Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::cache::CacheConfig;
    use crate::domain::OutboxStatus;
    use crate::infra::db::MemoryStores;
    use crate::infra::substrate::MemorySubstrate;

    use super::*;

    fn read_service_with(stores: Arc<MemoryStores>) -> EntityReadService {
        let cache = Arc::new(CacheEngine::new(
            Arc::new(MemorySubstrate::new()),
            CacheConfig::default(),
        ));
        EntityReadService::new(cache, stores)
    }

    fn seeded_record(id: &str, payload: Value) -> crate::domain::EntityRecord {
        let now = time::OffsetDateTime::now_utc();
        crate::domain::EntityRecord {
            id: id.to_string(),
            payload,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn read_miss_then_hit() {
        let stores = Arc::new(MemoryStores::new());
        stores.insert_entity(seeded_record("e-42", json!({"n": "x"})));
        let service = read_service_with(stores);

        let first = service.get("e-42").await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(first.value, Some(Bytes::from_static(b"{\"n\":\"x\"}")));

        let second = service.get("e-42").await.unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn absent_entity_goes_negative() {
        let stores = Arc::new(MemoryStores::new());
        let service = read_service_with(stores);

        let first = service.get("e-404").await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        assert!(first.value.is_none());

        let second = service.get("e-404").await.unwrap();
        assert_eq!(second.status, CacheStatus::Negative);
    }

    #[tokio::test]
    async fn open_circuit_fails_reads_fast() {
        struct FailingStore;

        #[async_trait]
        impl crate::application::repos::EntityStore for FailingStore {
            async fn find_entity(
                &self,
                _id: &str,
            ) -> Result<Option<crate::domain::EntityRecord>, crate::application::repos::RepoError>
            {
                Err(crate::application::repos::RepoError::from_persistence(
                    "connection refused",
                ))
            }

            async fn list_entities(
                &self,
                _limit: u32,
                _offset: u64,
            ) -> Result<EntityPage, crate::application::repos::RepoError> {
                Err(crate::application::repos::RepoError::from_persistence(
                    "connection refused",
                ))
            }

            async fn upsert_entity(
                &self,
                _id: &str,
                _payload: &Value,
                _outbox: &OutboxMessage,
            ) -> Result<crate::domain::EntityRecord, crate::application::repos::RepoError>
            {
                unreachable!("read-only test store")
            }

            async fn delete_entity(
                &self,
                _id: &str,
                _outbox: &OutboxMessage,
            ) -> Result<bool, crate::application::repos::RepoError> {
                unreachable!("read-only test store")
            }
        }

        let cache = Arc::new(CacheEngine::new(
            Arc::new(MemorySubstrate::new()),
            CacheConfig::default(),
        ));
        let breaker = Arc::new(crate::infra::breaker::CircuitBreaker::new(
            "read-model",
            crate::infra::breaker::BreakerConfig {
                max_failures: 1,
                ..Default::default()
            },
        ));
        let service =
            EntityReadService::with_breaker(cache, Arc::new(FailingStore), breaker.clone());

        // First read trips the breaker through a real loader failure.
        let first = service.get("e-1").await;
        assert!(matches!(first, Err(AppError::Cache(CacheError::Loader(_)))));

        // Subsequent reads fail fast without touching the store.
        let second = service.get("e-1").await;
        assert!(matches!(
            second,
            Err(AppError::Cache(CacheError::CircuitOpen("read-model")))
        ));
    }

    #[tokio::test]
    async fn list_caches_by_query_hash() {
        let stores = Arc::new(MemoryStores::new());
        stores.insert_entity(seeded_record("e-1", json!({"n": 1})));
        let service = read_service_with(stores);

        let (_, status) = service.list(20, 0).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        let (body, status) = service.list(20, 0).await.unwrap();
        assert_eq!(status, CacheStatus::Hit);

        let page: EntityPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.total, 1);

        // A different window is a different cache entry.
        let (_, status) = service.list(20, 20).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn create_stages_created_event() {
        let stores = Arc::new(MemoryStores::new());
        let handler = EntityCommandHandler::new(stores.clone());

        let command = Command::new("entity.create", "e-1", json!({"name": "a"}));
        handler.handle(&command).await.unwrap();

        let rows = stores.outbox_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "entity.created");
        assert_eq!(rows[0].topic, TOPIC_EVENTS);
        assert_eq!(rows[0].status, OutboxStatus::Pending);

        let event: ChangeEvent = serde_json::from_value(rows[0].payload.clone()).unwrap();
        assert_eq!(event.data, Some(json!({"name": "a"})));
    }

    #[tokio::test]
    async fn delete_of_missing_entity_fails() {
        let stores = Arc::new(MemoryStores::new());
        let handler = EntityCommandHandler::new(stores.clone());

        let command = Command::new("entity.delete", "e-9", json!({}));
        assert!(matches!(
            handler.handle(&command).await,
            Err(AppError::NotFound)
        ));
        // No event staged for a write that did not happen.
        assert!(stores.outbox_rows().is_empty());
    }

    #[tokio::test]
    async fn meta_slot_is_stripped_and_carried_as_tags() {
        let stores = Arc::new(MemoryStores::new());
        let handler = EntityCommandHandler::new(stores.clone());

        let payload = json!({
            "name": "a",
            "_meta": {"cache_tags": ["reports"]}
        });
        let command = Command::new("entity.update", "e-1", payload);
        // Update on a missing entity is an upsert by design.
        handler.handle(&command).await.unwrap();

        let entity = stores.find_entity("e-1").await.unwrap().unwrap();
        assert!(entity.payload.get("_meta").is_none());

        let rows = stores.outbox_rows();
        let metadata = rows[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.cache_tags, vec!["reports".to_string()]);
    }
}

