//! Outbox relay: drains pending messages onto the event log.
//!
//! Publication is at-least-once. A crash between a successful publish and
//! `mark_published` replays the message after the lease expires; consumers
//! deduplicate on the message id.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::domain::{DeadLetter, OutboxMessage, TOPIC_DEAD_LETTER};
use crate::infra::breaker::CircuitBreaker;
use crate::infra::eventlog::EventLog;

use super::error::AppError;
use super::repos::OutboxStore;
use super::shutdown::Shutdown;

const METRIC_RELAY_PUBLISHED: &str = "staffetta_relay_published_total";
const METRIC_RELAY_RETRIED: &str = "staffetta_relay_retried_total";
const METRIC_RELAY_DEAD_LETTERED: &str = "staffetta_relay_dead_lettered_total";
const METRIC_RELAY_BATCH_SECONDS: &str = "staffetta_relay_batch_seconds";
const METRIC_RELAY_PENDING: &str = "staffetta_relay_pending_backlog";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: i32,
    /// How long a fetched batch stays invisible to other relay instances.
    pub lease: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    /// This instance's slot when sharding by aggregate hash.
    pub partition_index: u32,
    /// Total relay instances; 1 disables partition filtering.
    pub partition_count: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            lease: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            partition_index: 0,
            partition_count: 1,
        }
    }
}

/// The relay loop plus its slower cleanup sibling.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    log: Arc<dyn EventLog>,
    breaker: Arc<CircuitBreaker>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        log: Arc<dyn EventLog>,
        breaker: Arc<CircuitBreaker>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            log,
            breaker,
            config,
        }
    }

    /// Run until shutdown. The current batch always finishes before exit.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            partition_index = self.config.partition_index,
            partition_count = self.config.partition_count,
            "Outbox relay started"
        );

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.process_batch().await {
                        error!(error = %err, "Relay batch failed");
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    }

    /// Retention-based cleanup of published rows; meant to run on its own
    /// slower cadence.
    pub async fn run_cleanup(&self, mut shutdown: Shutdown) {
        let mut tick = tokio::time::interval(self.config.cleanup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // the first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    match self.store.cleanup_published(self.config.retention).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "Cleaned up published outbox rows"),
                        Err(err) => warn!(error = %err, "Outbox cleanup failed"),
                    }
                }
            }
        }
    }

    /// Drain one batch: fetch leased messages, publish each, mark outcomes.
    #[instrument(skip(self))]
    pub async fn process_batch(&self) -> Result<usize, AppError> {
        let batch_started_at = std::time::Instant::now();
        let messages = self
            .store
            .fetch_pending(
                self.config.batch_size,
                self.config.partition_index,
                self.config.partition_count,
                self.config.lease,
            )
            .await?;

        if messages.is_empty() {
            return Ok(0);
        }

        let count = messages.len();
        for message in &messages {
            self.process_message(message).await;
        }

        if let Ok(backlog) = self.store.pending_count().await {
            gauge!(METRIC_RELAY_PENDING).set(backlog as f64);
        }
        histogram!(METRIC_RELAY_BATCH_SECONDS)
            .record(batch_started_at.elapsed().as_secs_f64());
        Ok(count)
    }

    async fn process_message(&self, message: &OutboxMessage) {
        let publish_result = match self.breaker.acquire() {
            Ok(()) => {
                let payload = match serde_json::to_vec(&message.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        // Undecodable payloads never publish; park them.
                        self.dead_letter(message, &format!("payload serialization: {err}"))
                            .await;
                        return;
                    }
                };
                let result = self
                    .log
                    .publish(&message.topic, &message.id.to_string(), &payload)
                    .await;
                match &result {
                    Ok(()) => self.breaker.record_success(),
                    Err(_) => self.breaker.record_failure(),
                }
                result.map_err(|err| err.to_string())
            }
            Err(err) => Err(err.to_string()),
        };

        match publish_result {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(message.id).await {
                    // The publish landed; a replay after restart is the
                    // documented at-least-once duplicate.
                    warn!(message_id = %message.id, error = %err, "MarkPublished failed");
                    return;
                }
                counter!(METRIC_RELAY_PUBLISHED).increment(1);
            }
            Err(reason) => {
                if message.retry_count >= self.config.max_retries {
                    self.dead_letter(message, &reason).await;
                } else {
                    let backoff =
                        self.config.retry_delay * (message.retry_count.max(0) as u32 + 1);
                    let next_attempt = OffsetDateTime::now_utc() + backoff;
                    if let Err(err) = self
                        .store
                        .reschedule(message.id, &reason, next_attempt)
                        .await
                    {
                        error!(message_id = %message.id, error = %err, "Reschedule failed");
                        return;
                    }
                    counter!(METRIC_RELAY_RETRIED).increment(1);
                    warn!(
                        message_id = %message.id,
                        retry = message.retry_count + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "Publish failed, rescheduled"
                    );
                }
            }
        }
    }

    /// Terminal failure: keep the row for inspection and emit a dead-letter
    /// record with enough provenance to replay by hand.
    async fn dead_letter(&self, message: &OutboxMessage, reason: &str) {
        if let Err(err) = self.store.mark_failed(message.id, reason).await {
            error!(message_id = %message.id, error = %err, "MarkFailed failed");
            return;
        }
        counter!(METRIC_RELAY_DEAD_LETTERED).increment(1);
        error!(
            message_id = %message.id,
            topic = %message.topic,
            retry_count = message.retry_count,
            reason = %reason,
            "Message exceeded retry budget"
        );

        let record = DeadLetter {
            message_id: message.id,
            original_topic: message.topic.clone(),
            event_type: message.event_type.clone(),
            aggregate_type: message.aggregate_type.clone(),
            aggregate_id: message.aggregate_id.clone(),
            error: reason.to_string(),
            retry_count: message.retry_count,
            failed_at: OffsetDateTime::now_utc(),
        };
        if let Ok(payload) = serde_json::to_vec(&record) {
            // Best effort: the durable row already carries the state.
            if let Err(err) = self
                .log
                .publish(TOPIC_DEAD_LETTER, &message.id.to_string(), &payload)
                .await
            {
                warn!(message_id = %message.id, error = %err, "Dead-letter publish failed");
            }
        }
    }
}
