//! Command model: accepted write operations and their lifecycle.
//!
//! Status transitions are monotonic except for the `pending ↔ retrying`
//! cycle driven by the retry scheduler. Once a command reaches a terminal
//! state, payload and error detail are immutable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;

/// Lifecycle status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions; monotonic except pending ↔ retrying.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Retrying, Pending) | (Retrying, Processing) | (Retrying, Cancelled) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Retrying) => true,
            _ => false,
        }
    }
}

impl TryFrom<&str> for CommandStatus {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown command status `{other}`"
            ))),
        }
    }
}

/// Processing priority, stored as a smallint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<i16> for Priority {
    type Error = DomainError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(DomainError::validation(format!(
                "priority `{other}` is outside the defined set"
            ))),
        }
    }
}

/// Structured failure detail recorded against a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A write operation accepted by the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub command_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub subject: Option<String>,
    pub correlation_id: Option<String>,
    pub status: CommandStatus,
    pub priority: Priority,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub error: Option<ErrorDetail>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_for: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Command {
    /// Create a pending command with default retry policy.
    pub fn new(command_type: impl Into<String>, entity_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            command_type: command_type.into(),
            entity_id: entity_id.into(),
            payload,
            idempotency_key: None,
            subject: None,
            correlation_id: None,
            status: CommandStatus::Pending,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            error: None,
            scheduled_for: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            completed_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// A failed command may re-enter the queue while retries remain.
    pub fn is_retryable(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Back-off grows linearly with the attempt count.
    pub fn next_retry_at(&self) -> OffsetDateTime {
        let backoff = self.retry_backoff * (self.retry_count.max(1) as u32);
        OffsetDateTime::now_utc() + backoff
    }

    pub fn record_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.error = Some(ErrorDetail::new(code, message));
    }
}

/// Wire form of a command on the command topic. Consumers load the
/// authoritative row by id before doing any work, so duplicate deliveries
/// collapse to one effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

impl From<&Command> for CommandEnvelope {
    fn from(cmd: &Command) -> Self {
        Self {
            command_id: cmd.id,
            command_type: cmd.command_type.clone(),
            entity_id: cmd.entity_id.clone(),
            payload: cmd.payload.clone(),
        }
    }
}

/// Snapshot returned by status lookups; the command store is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    pub entity_id: String,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl From<&Command> for CommandStatusView {
    fn from(cmd: &Command) -> Self {
        Self {
            id: cmd.id,
            command_type: cmd.command_type.clone(),
            entity_id: cmd.entity_id.clone(),
            status: cmd.status,
            created_at: cmd.created_at,
            processed_at: cmd.processed_at,
            error: cmd.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            CommandStatus::Pending,
            CommandStatus::Processing,
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Retrying,
            CommandStatus::Cancelled,
        ] {
            assert_eq!(CommandStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(CommandStatus::try_from("unknown").is_err());
    }

    #[test]
    fn terminal_states_do_not_transition() {
        for terminal in [
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(CommandStatus::Pending));
            assert!(!terminal.can_transition_to(CommandStatus::Processing));
        }
    }

    #[test]
    fn retrying_cycles_back_to_pending() {
        assert!(CommandStatus::Processing.can_transition_to(CommandStatus::Retrying));
        assert!(CommandStatus::Retrying.can_transition_to(CommandStatus::Pending));
        assert!(!CommandStatus::Completed.can_transition_to(CommandStatus::Retrying));
    }

    #[test]
    fn priority_bounds() {
        assert_eq!(Priority::try_from(2).unwrap(), Priority::Normal);
        assert!(Priority::try_from(0).is_err());
        assert!(Priority::try_from(5).is_err());
    }

    #[test]
    fn retry_backoff_grows_with_count() {
        let mut cmd = Command::new("entity.update", "e-1", serde_json::json!({}));
        cmd.retry_count = 1;
        let first = cmd.next_retry_at();
        cmd.retry_count = 3;
        let third = cmd.next_retry_at();
        assert!(third > first);
    }

    #[test]
    fn new_command_defaults() {
        let cmd = Command::new("entity.create", "e-9", serde_json::json!({"name": "a"}));
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.priority, Priority::Normal);
        assert_eq!(cmd.retry_count, 0);
        assert!(cmd.is_retryable());
    }
}
