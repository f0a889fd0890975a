//! Real-time fan-out: rooms, sessions, and the pub/sub bridge.

mod config;
mod hub;
mod message;
mod session;

pub use config::RealtimeConfig;
pub use hub::{AllowAllRooms, Hub, RoomPolicy, SessionHandle};
pub use message::{channel_for, room_from_channel, ClientAction, ClientCommand, RealtimeMessage};
pub use session::run_session;
