//! Cache substrate: the shared key/value service with pub/sub.
//!
//! The engine and the real-time hub both talk to the substrate through the
//! [`Substrate`] trait so the production Redis client and the in-memory
//! implementation used by tests and offline runs are interchangeable.

mod memory;
mod redis;

pub use memory::MemorySubstrate;
pub use redis::RedisSubstrate;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("substrate connection failed: {0}")]
    Connection(String),
    #[error("substrate command failed: {0}")]
    Command(String),
    #[error("substrate subscription closed")]
    SubscriptionClosed,
}

impl From<::redis::RedisError> for SubstrateError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Handle to an active pattern subscription.
///
/// Dropping the subscription tears down the underlying listener.
pub struct Subscription {
    receiver: mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<PubSubMessage>) -> Self {
        Self { receiver }
    }

    /// Await the next message; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }
}

/// Shared key/value store with TTLs, incremental scan, and pub/sub.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Fetch a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SubstrateError>;

    /// Store a value with a millisecond-precision TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SubstrateError>;

    /// Remove keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, SubstrateError>;

    /// One step of an incremental scan. Returns the next cursor (0 when the
    /// iteration is complete) and the keys matched in this step.
    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), SubstrateError>;

    /// Publish a payload to a channel; delivery is fire-and-forget.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SubstrateError>;

    /// Subscribe to every channel matching a glob pattern.
    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription, SubstrateError>;

    /// Liveness probe for health aggregation.
    async fn ping(&self) -> Result<(), SubstrateError>;
}

/// Glob matching with the substrate's semantics: `*`, `?`, and `[...]`
/// character classes. Used by the in-memory implementation; the server
/// evaluates patterns itself in production.
pub(crate) fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(pat: &[u8], text: &[u8]) -> bool {
        match (pat.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pat[1..], text) || (!text.is_empty() && inner(pat, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pat[1..], &text[1..]),
            (Some(b'['), Some(c)) => {
                let Some(end) = pat.iter().position(|b| *b == b']') else {
                    return false;
                };
                let class = &pat[1..end];
                let (negated, class) = match class.first() {
                    Some(b'^') => (true, &class[1..]),
                    _ => (false, class),
                };
                let mut matched = false;
                let mut i = 0;
                while i < class.len() {
                    if i + 2 < class.len() && class[i + 1] == b'-' {
                        if class[i] <= *c && *c <= class[i + 2] {
                            matched = true;
                        }
                        i += 3;
                    } else {
                        if class[i] == *c {
                            matched = true;
                        }
                        i += 1;
                    }
                }
                if matched != negated {
                    inner(&pat[end + 1..], &text[1..])
                } else {
                    false
                }
            }
            (Some(p), Some(c)) if p == c => inner(&pat[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_and_question() {
        assert!(glob_match("stf:v1:entity:*", "stf:v1:entity:e-42"));
        assert!(glob_match("realtime:*", "realtime:entity.e-1"));
        assert!(glob_match("e-?", "e-1"));
        assert!(!glob_match("e-?", "e-12"));
        assert!(!glob_match("stf:v1:tag:*", "stf:v1:entity:e-42"));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match("e-[0-9]", "e-7"));
        assert!(!glob_match("e-[0-9]", "e-x"));
        assert!(glob_match("e-[^0-9]", "e-x"));
    }

    #[test]
    fn glob_exact() {
        assert!(glob_match("stf:v1:entity:e-1", "stf:v1:entity:e-1"));
        assert!(!glob_match("stf:v1:entity:e-1", "stf:v1:entity:e-2"));
    }
}
