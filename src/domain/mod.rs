//! Domain model: commands, outbox messages, change events, entities.

pub mod command;
pub mod entity;
pub mod error;
pub mod event;
pub mod outbox;

pub use command::{Command, CommandEnvelope, CommandStatus, CommandStatusView, ErrorDetail, Priority};
pub use entity::{EntityPage, EntityRecord};
pub use error::DomainError;
pub use event::{
    ChangeAction, ChangeEvent, DeadLetter, TOPIC_COMMANDS, TOPIC_DEAD_LETTER, TOPIC_EVENTS,
};
pub use outbox::{aggregate_partition, OutboxMessage, OutboxMetadata, OutboxStatus};
