//! Distributed real-time hub.
//!
//! Each hub instance owns its local sessions and a room → sessions map.
//! Cross-process fan-out rides the pub/sub substrate exclusively: every
//! publication, local or remote in origin, goes out on `realtime:<room>`
//! and comes back through the pattern subscription, so all instances see
//! the same stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::RecoverableRwLock;
use crate::infra::breaker::CircuitBreaker;
use crate::infra::substrate::{Substrate, SubstrateError};

use super::config::RealtimeConfig;
use super::message::{channel_for, room_from_channel, RealtimeMessage};

const METRIC_WS_CONNECTIONS: &str = "staffetta_ws_connections";
const METRIC_WS_MESSAGES_OUT: &str = "staffetta_ws_messages_out_total";
const METRIC_WS_DROPPED: &str = "staffetta_ws_dropped_total";

/// Authorization seam for room joins. Denials leave the session open.
pub trait RoomPolicy: Send + Sync {
    fn allow_join(&self, subject: &str, room: &str) -> bool;
}

/// Default policy: any authenticated subject may join any room.
pub struct AllowAllRooms;

impl RoomPolicy for AllowAllRooms {
    fn allow_join(&self, _subject: &str, _room: &str) -> bool {
        true
    }
}

/// Hub-side handle to one connected client.
pub struct SessionHandle {
    pub id: Uuid,
    pub subject: String,
    sender: mpsc::Sender<Bytes>,
    consecutive_drops: AtomicU32,
}

/// Process-local hub state plus the substrate bridge.
pub struct Hub {
    substrate: Arc<dyn Substrate>,
    config: RealtimeConfig,
    policy: Arc<dyn RoomPolicy>,
    breaker: Option<Arc<CircuitBreaker>>,
    rooms: RecoverableRwLock<HashMap<String, HashMap<Uuid, Arc<SessionHandle>>>>,
    sessions: RecoverableRwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    shutting_down: AtomicBool,
    connection_count: AtomicI64,
}

impl Hub {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        config: RealtimeConfig,
        policy: Arc<dyn RoomPolicy>,
    ) -> Self {
        Self {
            substrate,
            config,
            policy,
            breaker: None,
            rooms: RecoverableRwLock::new("hub.rooms", HashMap::new()),
            sessions: RecoverableRwLock::new("hub.sessions", HashMap::new()),
            shutting_down: AtomicBool::new(false),
            connection_count: AtomicI64::new(0),
        }
    }

    /// Guard outbound substrate publishes with a circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn connection_count(&self) -> i64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register a session; the returned receiver feeds the socket writer.
    pub fn register(&self, subject: impl Into<String>) -> (Arc<SessionHandle>, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(self.config.outbound_buffer.max(1));
        let handle = Arc::new(SessionHandle {
            id: Uuid::new_v4(),
            subject: subject.into(),
            sender,
            consecutive_drops: AtomicU32::new(0),
        });

        self.sessions.write("register").insert(handle.id, handle.clone());
        let connections = self.connection_count.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(METRIC_WS_CONNECTIONS).set(connections as f64);
        info!(session_id = %handle.id, subject = %handle.subject, connections, "Client connected");
        (handle, receiver)
    }

    /// Remove a session from every room and drop its outbound sender,
    /// which unblocks the socket writer deterministically.
    pub fn unregister(&self, session_id: Uuid) {
        let removed = self.sessions.write("unregister").remove(&session_id);
        if removed.is_none() {
            return;
        }

        let mut rooms = self.rooms.write("unregister");
        rooms.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
        drop(rooms);

        let connections = self.connection_count.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!(METRIC_WS_CONNECTIONS).set(connections as f64);
        info!(session_id = %session_id, connections, "Client disconnected");
    }

    /// Join a room; authorization is delegated to the policy. A denied join
    /// returns false without closing the session.
    pub fn join(&self, session: &Arc<SessionHandle>, room: &str) -> bool {
        if room.is_empty() || self.is_shutting_down() {
            return false;
        }
        if !self.policy.allow_join(&session.subject, room) {
            warn!(session_id = %session.id, room, "Join denied by policy");
            return false;
        }

        self.rooms
            .write("join")
            .entry(room.to_string())
            .or_default()
            .insert(session.id, session.clone());
        debug!(session_id = %session.id, room, "Client joined room");
        true
    }

    /// Leave a room; removing the last member removes the room.
    pub fn leave(&self, session_id: Uuid, room: &str) {
        let mut rooms = self.rooms.write("leave");
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        debug!(session_id = %session_id, room, "Client left room");
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms
            .read("room_size")
            .get(room)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Whether a session currently belongs to a room.
    pub fn in_room(&self, session_id: Uuid, room: &str) -> bool {
        self.rooms
            .read("in_room")
            .get(room)
            .is_some_and(|members| members.contains_key(&session_id))
    }

    /// System-side publication: stamp, serialize, and hand to the substrate.
    /// Never blocks on any client buffer; local delivery happens when the
    /// message comes back through the subscription.
    pub async fn publish_update(
        &self,
        room: &str,
        message: RealtimeMessage,
    ) -> Result<(), SubstrateError> {
        if self.is_shutting_down() {
            return Ok(());
        }
        if let Some(breaker) = &self.breaker {
            breaker
                .acquire()
                .map_err(|err| SubstrateError::Command(err.to_string()))?;
        }
        let message = message.stamped();
        let payload = serde_json::to_vec(&message)
            .map_err(|err| SubstrateError::Command(format!("message serialization: {err}")))?;
        let result = self.substrate.publish(&channel_for(room), &payload).await;
        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(()) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
        result
    }

    /// Client-side publication: membership is required; the payload goes
    /// through the substrate like any other publication so every instance
    /// sees it uniformly.
    pub async fn publish_from_client(
        &self,
        session: &Arc<SessionHandle>,
        room: &str,
        payload: serde_json::Value,
    ) -> Result<(), SubstrateError> {
        if !self.in_room(session.id, room) {
            warn!(session_id = %session.id, room, "Publish rejected: not a member");
            return Ok(());
        }
        let message = RealtimeMessage::new("client", room, "publish", payload);
        self.publish_update(room, message).await
    }

    /// Deliver a frame to every local member of a room.
    ///
    /// Slow consumers lose the frame rather than stalling the fan-out: a
    /// full buffer counts a drop, and a session exceeding the configured
    /// consecutive-drop budget is disconnected.
    pub fn deliver_local(&self, room: &str, frame: &Bytes) {
        let members: Vec<Arc<SessionHandle>> = {
            let rooms = self.rooms.read("deliver_local");
            match rooms.get(room) {
                Some(members) => members.values().cloned().collect(),
                None => return,
            }
        };

        let mut delivered = 0usize;
        let mut dropped = 0usize;
        let mut to_disconnect = Vec::new();

        for member in members {
            match member.sender.try_send(frame.clone()) {
                Ok(()) => {
                    member.consecutive_drops.store(0, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    counter!(METRIC_WS_DROPPED).increment(1);
                    let streak = member.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        session_id = %member.id,
                        room,
                        streak,
                        "Message dropped: client buffer full"
                    );
                    let budget = self.config.max_consecutive_drops;
                    if budget > 0 && streak >= budget {
                        to_disconnect.push(member.id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    to_disconnect.push(member.id);
                }
            }
        }

        counter!(METRIC_WS_MESSAGES_OUT).increment(delivered as u64);
        if dropped > 0 {
            warn!(room, delivered, dropped, "Broadcast completed with drops");
        }
        for session_id in to_disconnect {
            self.unregister(session_id);
        }
    }

    /// Bridge loop: receive from the substrate subscription and fan out to
    /// local rooms until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: crate::application::shutdown::Shutdown,
    ) -> Result<(), SubstrateError> {
        let mut subscription = self
            .substrate
            .subscribe_pattern(&format!("{}*", super::message::CHANNEL_PREFIX))
            .await?;
        info!("Realtime hub subscribed to substrate");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = subscription.recv() => {
                    let Some(message) = received else {
                        warn!("Substrate subscription closed");
                        break;
                    };
                    if let Some(room) = room_from_channel(&message.channel) {
                        self.deliver_local(room, &message.payload);
                    }
                }
            }
        }

        self.close_all();
        Ok(())
    }

    /// Stop delivery and drop every session. No messages go out after this
    /// begins; in-flight writers observe closed channels, not panics.
    pub fn close_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.rooms.write("close_all").clear();
        let mut sessions = self.sessions.write("close_all");
        let count = sessions.len();
        sessions.clear();
        drop(sessions);
        self.connection_count.store(0, Ordering::Relaxed);
        info!(closed = count, "Realtime hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::infra::substrate::MemorySubstrate;

    use super::*;

    fn hub_with_substrate() -> (Arc<Hub>, Arc<MemorySubstrate>) {
        let substrate = Arc::new(MemorySubstrate::new());
        let hub = Arc::new(Hub::new(
            substrate.clone(),
            RealtimeConfig::default(),
            Arc::new(AllowAllRooms),
        ));
        (hub, substrate)
    }

    #[tokio::test]
    async fn join_leave_updates_rooms() {
        let (hub, _) = hub_with_substrate();
        let (session, _rx) = hub.register("alice");

        assert!(hub.join(&session, "entity.e-1"));
        assert_eq!(hub.room_size("entity.e-1"), 1);
        assert!(hub.in_room(session.id, "entity.e-1"));

        hub.leave(session.id, "entity.e-1");
        assert_eq!(hub.room_size("entity.e-1"), 0);
        assert!(!hub.in_room(session.id, "entity.e-1"));
    }

    #[tokio::test]
    async fn unregister_removes_from_all_rooms() {
        let (hub, _) = hub_with_substrate();
        let (session, _rx) = hub.register("alice");
        hub.join(&session, "entity.e-1");
        hub.join(&session, "entity.*");

        hub.unregister(session.id);
        assert_eq!(hub.room_size("entity.e-1"), 0);
        assert_eq!(hub.room_size("entity.*"), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn deliver_reaches_members_only() {
        let (hub, _) = hub_with_substrate();
        let (a, mut rx_a) = hub.register("a");
        let (b, mut rx_b) = hub.register("b");
        let (_c, mut rx_c) = hub.register("c");
        hub.join(&a, "entity.e-50");
        hub.join(&b, "entity.e-50");

        hub.deliver_local("entity.e-50", &Bytes::from_static(b"frame"));

        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"frame"));
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"frame"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_without_blocking() {
        let substrate = Arc::new(MemorySubstrate::new());
        let config = RealtimeConfig {
            outbound_buffer: 2,
            max_consecutive_drops: 0,
            ..RealtimeConfig::default()
        };
        let hub = Arc::new(Hub::new(substrate, config, Arc::new(AllowAllRooms)));
        let (session, mut rx) = hub.register("slow");
        hub.join(&session, "r");

        for _ in 0..5 {
            hub.deliver_local("r", &Bytes::from_static(b"x"));
        }

        // Two buffered, three dropped, session still registered.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.in_room(session.id, "r"));
    }

    #[tokio::test]
    async fn consecutive_drop_budget_disconnects() {
        let substrate = Arc::new(MemorySubstrate::new());
        let config = RealtimeConfig {
            outbound_buffer: 1,
            max_consecutive_drops: 3,
            ..RealtimeConfig::default()
        };
        let hub = Arc::new(Hub::new(substrate, config, Arc::new(AllowAllRooms)));
        let (session, _rx) = hub.register("slow");
        hub.join(&session, "r");

        // First frame fills the buffer; the next three exhaust the budget.
        for _ in 0..4 {
            hub.deliver_local("r", &Bytes::from_static(b"x"));
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn policy_denial_keeps_session_open() {
        struct DenyAll;
        impl RoomPolicy for DenyAll {
            fn allow_join(&self, _subject: &str, _room: &str) -> bool {
                false
            }
        }

        let substrate = Arc::new(MemorySubstrate::new());
        let hub = Arc::new(Hub::new(
            substrate,
            RealtimeConfig::default(),
            Arc::new(DenyAll),
        ));
        let (session, _rx) = hub.register("alice");

        assert!(!hub.join(&session, "entity.e-1"));
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn publish_round_trips_through_substrate() {
        let (hub, substrate) = hub_with_substrate();
        let mut subscription = substrate.subscribe_pattern("realtime:*").await.unwrap();

        hub.publish_update(
            "entity.e-50",
            RealtimeMessage::new("entity", "e-50", "updated", json!({"v": 2})),
        )
        .await
        .unwrap();

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.channel, "realtime:entity.e-50");
        let message: RealtimeMessage = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(message.entity, "e-50");
        assert_eq!(message.action, "updated");
    }

    #[tokio::test]
    async fn client_publish_requires_membership() {
        let (hub, substrate) = hub_with_substrate();
        let mut subscription = substrate.subscribe_pattern("realtime:*").await.unwrap();
        let (session, _rx) = hub.register("alice");

        // Not a member: silently rejected.
        hub.publish_from_client(&session, "r", json!({"m": 1}))
            .await
            .unwrap();

        hub.join(&session, "r");
        hub.publish_from_client(&session, "r", json!({"m": 2}))
            .await
            .unwrap();

        let received = subscription.recv().await.unwrap();
        let message: RealtimeMessage = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(message.data, json!({"m": 2}));
    }

    #[tokio::test]
    async fn shutdown_stops_delivery() {
        let (hub, _) = hub_with_substrate();
        let (session, mut rx) = hub.register("alice");
        hub.join(&session, "r");

        hub.close_all();
        assert!(hub.is_shutting_down());
        hub.deliver_local("r", &Bytes::from_static(b"late"));
        assert!(rx.try_recv().is_err());

        // Publications after shutdown are dropped silently.
        hub.publish_update("r", RealtimeMessage::new("entity", "r", "updated", json!({})))
            .await
            .unwrap();
    }
}
