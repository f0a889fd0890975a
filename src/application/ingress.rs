//! Command ingress: accept, deduplicate, and answer status lookups.
//!
//! Acceptance persists the command row, its outbox message, and the
//! idempotency mapping in one transaction; everything after the 202 happens
//! asynchronously and never changes the ingest response.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{keys, CacheEngine, Lookup};
use crate::domain::{
    Command, CommandEnvelope, CommandStatus, CommandStatusView, OutboxMessage, OutboxMetadata,
    Priority, TOPIC_COMMANDS,
};

use super::error::AppError;
use super::repos::{CommandStore, SubmitOutcome};
use super::validation::CommandValidator;

const METRIC_COMMANDS_ACCEPTED: &str = "staffetta_commands_accepted_total";
const METRIC_COMMANDS_REPLAYED: &str = "staffetta_commands_replayed_total";

const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Retention window for idempotency mappings.
    pub idempotency_ttl: Duration,
    /// Prefix for the status-lookup URI returned on acceptance.
    pub status_path_prefix: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            status_path_prefix: "/v1/commands".to_string(),
        }
    }
}

/// An incoming write request, transport-agnostic.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub command_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache_tags: Vec<String>,
}

/// The ingest response: a command id and where to poll for its fate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Accepted {
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub status_url: String,
}

/// Ingress service: validation, idempotency, transactional acceptance, and
/// cache-first status lookups.
pub struct CommandIngress {
    store: Arc<dyn CommandStore>,
    validator: Arc<CommandValidator>,
    cache: Arc<CacheEngine>,
    config: IngressConfig,
}

impl CommandIngress {
    pub fn new(
        store: Arc<dyn CommandStore>,
        validator: Arc<CommandValidator>,
        cache: Arc<CacheEngine>,
        config: IngressConfig,
    ) -> Self {
        Self {
            store,
            validator,
            cache,
            config,
        }
    }

    /// Accept a command. Replays of a known idempotency key return the
    /// prior command id without touching storage.
    #[instrument(skip(self, request), fields(command_type = %request.command_type))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Accepted, AppError> {
        let command = self.build_command(request)?;
        self.validator.validate(&command)?;

        let envelope = serde_json::to_value(CommandEnvelope::from(&command))
            .map_err(|err| AppError::unexpected(format!("envelope serialization failed: {err}")))?;
        let outbox = OutboxMessage::new(
            "command",
            command.entity_id.clone(),
            command.command_type.clone(),
            envelope,
            TOPIC_COMMANDS,
        );

        let outcome = self
            .store
            .submit(&command, &outbox, self.config.idempotency_ttl)
            .await?;

        match outcome {
            SubmitOutcome::Accepted { command_id } => {
                counter!(METRIC_COMMANDS_ACCEPTED).increment(1);
                info!(
                    command_id = %command_id,
                    command_type = %command.command_type,
                    "Command accepted"
                );
                self.cache_status(&CommandStatusView::from(&command)).await;
                Ok(Accepted {
                    command_id,
                    status: CommandStatus::Pending,
                    status_url: self.status_url(command_id),
                })
            }
            SubmitOutcome::Replayed { command_id, status } => {
                counter!(METRIC_COMMANDS_REPLAYED).increment(1);
                info!(
                    command_id = %command_id,
                    idempotency_key = command.idempotency_key.as_deref().unwrap_or(""),
                    "Idempotent replay"
                );
                Ok(Accepted {
                    command_id,
                    status,
                    status_url: self.status_url(command_id),
                })
            }
        }
    }

    /// Status lookup: short-lived cache in front of the authoritative store.
    pub async fn status(&self, id: Uuid) -> Result<CommandStatusView, AppError> {
        let key = keys::command_status_key(id);
        if let Ok(Lookup::Hit(cached)) = self.cache.get(&key).await {
            if let Ok(view) = serde_json::from_slice::<CommandStatusView>(&cached) {
                return Ok(view);
            }
            warn!(command_id = %id, "Discarding undecodable cached status");
        }

        let command = self
            .store
            .find_command(id)
            .await?
            .ok_or(AppError::NotFound)?;
        let view = CommandStatusView::from(&command);
        self.cache_status(&view).await;
        Ok(view)
    }

    fn build_command(&self, request: SubmitRequest) -> Result<Command, AppError> {
        if let Some(timeout_ms) = request.timeout_ms {
            if timeout_ms == 0 {
                return Err(AppError::validation("timeout must be positive"));
            }
        }
        if request.max_retries.is_some_and(|retries| retries < 0) {
            return Err(AppError::validation("max_retries must be non-negative"));
        }

        let mut command = Command::new(request.command_type, request.entity_id, request.payload);
        command.idempotency_key = request.idempotency_key;
        command.subject = request.subject;
        command.correlation_id = request.correlation_id;
        if let Some(priority) = request.priority {
            command.priority = priority;
        }
        if let Some(max_retries) = request.max_retries {
            command.max_retries = max_retries;
        }
        if let Some(timeout_ms) = request.timeout_ms {
            command.timeout = Duration::from_millis(timeout_ms);
        }
        if !request.cache_tags.is_empty() {
            // Carried through to the outbox by the command handlers.
            command.payload = attach_cache_tags(command.payload, request.cache_tags);
        }
        Ok(command)
    }

    async fn cache_status(&self, view: &CommandStatusView) {
        let ttl = if view.status.is_terminal() {
            self.cache.config().terminal_status_ttl()
        } else {
            self.cache.config().status_ttl()
        };
        match serde_json::to_vec(view) {
            Ok(body) => {
                self.cache
                    .set(&keys::command_status_key(view.id), &body, Some(ttl))
                    .await;
            }
            Err(err) => warn!(command_id = %view.id, error = %err, "Status serialization failed"),
        }
    }

    fn status_url(&self, id: Uuid) -> String {
        format!("{}/{id}", self.config.status_path_prefix)
    }
}

/// Fold request-level cache tags into the payload's metadata slot so they
/// survive the trip through the command topic.
fn attach_cache_tags(payload: Value, tags: Vec<String>) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            if !other.is_null() {
                map.insert("value".to_string(), other);
            }
            map
        }
    };
    let metadata = OutboxMetadata::with_cache_tags(tags);
    if let Ok(value) = serde_json::to_value(&metadata) {
        object.insert("_meta".to_string(), value);
    }
    Value::Object(object)
}

/// Extract cache tags previously folded into a payload.
pub fn extract_cache_tags(payload: &Value) -> Vec<String> {
    payload
        .get("_meta")
        .and_then(|meta| serde_json::from_value::<OutboxMetadata>(meta.clone()).ok())
        .map(|meta| meta.cache_tags)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::cache::CacheConfig;
    use crate::infra::db::MemoryStores;
    use crate::infra::substrate::MemorySubstrate;

    use super::*;

    fn ingress_with_stores() -> (CommandIngress, Arc<MemoryStores>) {
        let stores = Arc::new(MemoryStores::new());
        let cache = Arc::new(CacheEngine::new(
            Arc::new(MemorySubstrate::new()),
            CacheConfig::default(),
        ));
        let ingress = CommandIngress::new(
            stores.clone(),
            Arc::new(CommandValidator::with_entity_rules()),
            cache,
            IngressConfig::default(),
        );
        (ingress, stores)
    }

    fn create_request(key: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            command_type: "entity.create".to_string(),
            entity_id: "e-1".to_string(),
            payload: json!({"name": "a"}),
            idempotency_key: key.map(str::to_string),
            subject: None,
            correlation_id: None,
            priority: None,
            max_retries: None,
            timeout_ms: None,
            cache_tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn accepts_and_exposes_status_url() {
        let (ingress, stores) = ingress_with_stores();
        let accepted = ingress.submit(create_request(None)).await.unwrap();
        assert_eq!(accepted.status, CommandStatus::Pending);
        assert_eq!(
            accepted.status_url,
            format!("/v1/commands/{}", accepted.command_id)
        );
        assert_eq!(stores.command_count(), 1);
        assert_eq!(stores.outbox_rows().len(), 1);
        assert_eq!(stores.outbox_rows()[0].topic, TOPIC_COMMANDS);
    }

    #[tokio::test]
    async fn replays_same_idempotency_key() {
        let (ingress, stores) = ingress_with_stores();
        let first = ingress.submit(create_request(Some("k1"))).await.unwrap();
        let second = ingress.submit(create_request(Some("k1"))).await.unwrap();

        assert_eq!(first.command_id, second.command_id);
        assert_eq!(stores.command_count(), 1);
        assert_eq!(stores.outbox_rows().len(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_type() {
        let (ingress, _) = ingress_with_stores();
        let mut request = create_request(None);
        request.command_type = "entity.unknown".to_string();
        let err = ingress.submit(request).await.unwrap_err();
        assert!(matches!(err, AppError::Domain(_)));
    }

    #[tokio::test]
    async fn rejects_zero_timeout() {
        let (ingress, _) = ingress_with_stores();
        let mut request = create_request(None);
        request.timeout_ms = Some(0);
        assert!(matches!(
            ingress.submit(request).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn status_falls_back_to_store() {
        let (ingress, _) = ingress_with_stores();
        let accepted = ingress.submit(create_request(None)).await.unwrap();

        let view = ingress.status(accepted.command_id).await.unwrap();
        assert_eq!(view.id, accepted.command_id);
        assert_eq!(view.status, CommandStatus::Pending);

        assert!(matches!(
            ingress.status(Uuid::new_v4()).await,
            Err(AppError::NotFound)
        ));
    }

    #[test]
    fn cache_tags_round_trip_through_payload() {
        let payload = attach_cache_tags(json!({"name": "a"}), vec!["reports".to_string()]);
        assert_eq!(extract_cache_tags(&payload), vec!["reports".to_string()]);
        assert_eq!(payload["name"], "a");
    }
}
