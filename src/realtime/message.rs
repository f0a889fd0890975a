//! Wire messages between hub, substrate, and clients.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Channel prefix on the pub/sub substrate; the room name follows it.
pub const CHANNEL_PREFIX: &str = "realtime:";

/// Build the substrate channel for a room.
pub fn channel_for(room: &str) -> String {
    format!("{CHANNEL_PREFIX}{room}")
}

/// Extract the room from a substrate channel name.
pub fn room_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(CHANNEL_PREFIX)
}

/// Actions a client may request over its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    JoinRoom,
    LeaveRoom,
    Publish,
}

/// Inbound client frame: `{action, room, payload?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    pub action: ClientAction,
    pub room: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Outbound server frame: `{type, entity, action, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub entity: String,
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix seconds, stamped by the publisher.
    pub timestamp: i64,
}

impl RealtimeMessage {
    pub fn new(
        message_type: impl Into<String>,
        entity: impl Into<String>,
        action: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            entity: entity.into(),
            action: action.into(),
            data,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Re-stamp just before publication.
    pub fn stamped(mut self) -> Self {
        self.timestamp = OffsetDateTime::now_utc().unix_timestamp();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trip() {
        let channel = channel_for("entity.e-50");
        assert_eq!(channel, "realtime:entity.e-50");
        assert_eq!(room_from_channel(&channel), Some("entity.e-50"));
        assert_eq!(room_from_channel("other:entity.e-50"), None);
    }

    #[test]
    fn client_command_decodes_wire_form() {
        let frame: ClientCommand =
            serde_json::from_str(r#"{"action":"join_room","room":"entity.e-1"}"#).unwrap();
        assert_eq!(frame.action, ClientAction::JoinRoom);
        assert_eq!(frame.room, "entity.e-1");
        assert!(frame.payload.is_none());
    }

    #[test]
    fn realtime_message_wire_shape() {
        let message = RealtimeMessage::new("entity", "e-50", "updated", serde_json::json!({"v": 2}));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "entity");
        assert_eq!(json["entity"], "e-50");
        assert_eq!(json["action"], "updated");
        assert!(json["timestamp"].is_i64());
    }
}
