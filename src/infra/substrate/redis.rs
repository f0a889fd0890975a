//! Redis-backed substrate.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{PubSubMessage, Subscription, Substrate, SubstrateError};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// Substrate backed by a Redis server through a reconnecting manager.
///
/// Commands go over [`ConnectionManager`]; each pattern subscription holds
/// its own pub/sub connection because subscribed connections cannot issue
/// regular commands.
pub struct RedisSubstrate {
    client: Client,
    manager: ConnectionManager,
}

impl RedisSubstrate {
    /// Connect and verify the server is reachable.
    pub async fn connect(url: &str) -> Result<Self, SubstrateError> {
        let client = Client::open(url).map_err(SubstrateError::from)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(SubstrateError::from)?;

        let substrate = Self { client, manager };
        substrate.ping().await?;
        Ok(substrate)
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SubstrateError> {
        let mut conn = self.connection();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SubstrateError> {
        let mut conn = self.connection();
        // PX keeps millisecond precision so jittered TTLs survive intact.
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, SubstrateError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), SubstrateError> {
        let mut conn = self.connection();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SubstrateError> {
        let mut conn = self.connection();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription, SubstrateError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(SubstrateError::from)?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(SubstrateError::from)?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%channel, error = %err, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if sender
                    .send(PubSubMessage {
                        channel,
                        payload: Bytes::from(payload),
                    })
                    .await
                    .is_err()
                {
                    // Receiver dropped; tear the listener down.
                    break;
                }
            }
            debug!(pattern = %pattern, "Pub/sub listener stopped");
        });

        Ok(Subscription::new(receiver))
    }

    async fn ping(&self) -> Result<(), SubstrateError> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
