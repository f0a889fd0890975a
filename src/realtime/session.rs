//! One WebSocket session: reader and writer pumps.
//!
//! The reader applies client commands to the hub; the writer drains the
//! session's outbound buffer and owns the heartbeat. Either pump ending
//! tears the whole session down deterministically.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hub::{Hub, SessionHandle};
use super::message::{ClientAction, ClientCommand};

const METRIC_WS_MESSAGES_IN: &str = "staffetta_ws_messages_in_total";

/// Drive a connected socket until disconnect.
///
/// Owns registration and cleanup: when this returns, the session is out of
/// every room and both pumps have stopped.
pub async fn run_session(socket: WebSocket, hub: Arc<Hub>, subject: String) {
    let (session, outbound) = hub.register(subject);
    let session_id = session.id;
    let (sink, stream) = socket.split();

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let mut writer = tokio::spawn(write_pump(
        sink,
        outbound,
        hub.clone(),
        session_id,
        last_pong.clone(),
    ));
    let mut reader = tokio::spawn(read_pump(stream, hub.clone(), session.clone(), last_pong));

    // Whichever pump stops first ends the session.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unregister(session_id);
    drop(session);
    let _ = writer.await;
    let _ = reader.await;
    debug!(session_id = %session_id, "Session closed");
}

/// Drain outbound frames and keep the heartbeat. A closed buffer (hub
/// shutdown or disconnect) sends a close frame and stops; a missed pong
/// deadline stops without one.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<bytes::Bytes>,
    hub: Arc<Hub>,
    session_id: Uuid,
    last_pong: Arc<Mutex<Instant>>,
) {
    let config = hub.config().clone();
    let mut ping_tick = tokio::time::interval(config.ping_period());
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        let text = match String::from_utf8(frame.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!(session_id = %session_id, "Skipping non-UTF-8 outbound frame");
                                continue;
                            }
                        };
                        let send = tokio::time::timeout(
                            config.write_wait(),
                            sink.send(Message::Text(text)),
                        );
                        match send.await {
                            Ok(Ok(())) => {}
                            _ => {
                                warn!(session_id = %session_id, "Write failed or timed out");
                                return;
                            }
                        }
                    }
                    None => {
                        // Hub dropped the sender: orderly close.
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            _ = ping_tick.tick() => {
                let pong_age = {
                    let guard = last_pong.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard.elapsed()
                };
                if pong_age > config.pong_wait() {
                    warn!(session_id = %session_id, "Pong deadline missed, closing session");
                    return;
                }
                let ping = tokio::time::timeout(
                    config.write_wait(),
                    sink.send(Message::Ping(Vec::new())),
                );
                if !matches!(ping.await, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}

/// Apply inbound frames: join/leave/publish commands, pong bookkeeping.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: Arc<Hub>,
    session: Arc<SessionHandle>,
    last_pong: Arc<Mutex<Instant>>,
) {
    let max_bytes = hub.config().max_message_bytes;

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(session_id = %session.id, error = %err, "Read error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if text.len() > max_bytes {
                    warn!(
                        session_id = %session.id,
                        size = text.len(),
                        "Inbound frame exceeds size limit, closing"
                    );
                    break;
                }
                counter!(METRIC_WS_MESSAGES_IN).increment(1);
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(err) => {
                        debug!(session_id = %session.id, error = %err, "Undecodable client frame");
                        continue;
                    }
                };
                apply_command(&hub, &session, command).await;
            }
            Message::Pong(_) => {
                let mut guard = last_pong.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard = Instant::now();
            }
            Message::Ping(_) => {
                // The transport answers pings automatically.
            }
            Message::Binary(payload) => {
                debug!(
                    session_id = %session.id,
                    size = payload.len(),
                    "Ignoring binary frame"
                );
            }
            Message::Close(_) => {
                debug!(session_id = %session.id, "Client sent close frame");
                break;
            }
        }
    }
}

async fn apply_command(hub: &Arc<Hub>, session: &Arc<SessionHandle>, command: ClientCommand) {
    match command.action {
        ClientAction::JoinRoom => {
            hub.join(session, &command.room);
        }
        ClientAction::LeaveRoom => {
            hub.leave(session.id, &command.room);
        }
        ClientAction::Publish => {
            let payload = command.payload.unwrap_or(serde_json::Value::Null);
            if let Err(err) = hub.publish_from_client(session, &command.room, payload).await {
                warn!(session_id = %session.id, room = %command.room, error = %err, "Client publish failed");
            }
        }
    }
}
