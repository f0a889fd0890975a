//! Change events carried on the event log.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::outbox::OutboxMetadata;

/// Topic carrying commands for asynchronous handlers.
pub const TOPIC_COMMANDS: &str = "entity.commands";
/// Topic carrying state-change events.
pub const TOPIC_EVENTS: &str = "entity.events";
/// Topic receiving messages that exhausted their retry budget.
pub const TOPIC_DEAD_LETTER: &str = "entity.dead-letter";

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A state-change event consumed by the cache updater and other readers.
///
/// Consumers must be idempotent on `id`: the relay contract is
/// at-least-once, so duplicates are possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<OutboxMetadata>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: ChangeAction,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            data,
            metadata: None,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    /// Event type string published on the wire, e.g. `entity.updated`.
    pub fn event_type(&self) -> String {
        format!("{}.{}", self.entity_type, self.action.as_str())
    }

    /// Room this event fans out to, e.g. `entity.e-42`.
    pub fn room(&self) -> String {
        format!("{}.{}", self.entity_type, self.entity_id)
    }

    /// Wildcard sibling room covering every entity of this type.
    pub fn wildcard_room(&self) -> String {
        format!("{}.*", self.entity_type)
    }
}

/// Payload shipped to the dead-letter topic when a message exhausts its
/// retry budget. Keeps enough provenance to replay by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub original_topic: String,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub error: String,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_and_rooms() {
        let event = ChangeEvent::new("entity", "e-50", ChangeAction::Updated, None);
        assert_eq!(event.event_type(), "entity.updated");
        assert_eq!(event.room(), "entity.e-50");
        assert_eq!(event.wildcard_room(), "entity.*");
    }

    #[test]
    fn serde_round_trip() {
        let event = ChangeEvent::new(
            "entity",
            "e-1",
            ChangeAction::Created,
            Some(serde_json::json!({"name": "a"})),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.action, ChangeAction::Created);
        assert_eq!(back.entity_id, "e-1");
    }
}
