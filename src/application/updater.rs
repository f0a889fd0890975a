//! Cache updater: the consumer that keeps the cache and the real-time
//! surface in sync with the event log.
//!
//! Consumption is idempotent on the outbox message id; duplicates from the
//! at-least-once relay are absorbed by a bounded seen-set. Handler errors
//! retry with backoff, then acknowledge with an error record so one poison
//! message cannot wedge the stream.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::cache::{keys, CacheEngine};
use crate::domain::{ChangeAction, ChangeEvent};
use crate::infra::eventlog::{EventLogConsumer, LogRecord};
use crate::realtime::{Hub, RealtimeMessage};

use super::shutdown::Shutdown;

const METRIC_UPDATER_APPLIED: &str = "staffetta_updater_applied_total";
const METRIC_UPDATER_DUPLICATES: &str = "staffetta_updater_duplicates_total";
const METRIC_UPDATER_ERRORS: &str = "staffetta_updater_errors_total";

const SEEN_CAPACITY: usize = 16_384;
const HANDLER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub poll_batch: usize,
    pub poll_block_ms: u64,
    /// Base backoff between handler attempts; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            poll_batch: 100,
            poll_block_ms: 1000,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Bounded first-in-first-out dedup set.
struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl SeenSet {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SEEN_CAPACITY),
            members: HashSet::with_capacity(SEEN_CAPACITY),
        }
    }

    /// Returns false when the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }
}

/// Applies change events to the cache and fans them out to clients.
pub struct CacheUpdater {
    consumer: Arc<dyn EventLogConsumer>,
    cache: Arc<CacheEngine>,
    hub: Arc<Hub>,
    config: UpdaterConfig,
    seen: Mutex<SeenSet>,
}

impl CacheUpdater {
    pub fn new(
        consumer: Arc<dyn EventLogConsumer>,
        cache: Arc<CacheEngine>,
        hub: Arc<Hub>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            consumer,
            cache,
            hub,
            config,
            seen: Mutex::new(SeenSet::new()),
        }
    }

    /// Run until shutdown: poll, apply, acknowledge.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!("Cache updater started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.consumer.poll(self.config.poll_batch, self.config.poll_block_ms) => {
                    let records = match polled {
                        Ok(records) => records,
                        Err(err) => {
                            warn!(error = %err, "Event topic poll failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    for record in records {
                        self.consume_record(&record).await;
                        if let Err(err) = self.consumer.ack(&record).await {
                            warn!(entry = %record.entry_id, error = %err, "Ack failed");
                        }
                    }
                }
            }
        }
        info!("Cache updater stopped");
    }

    /// Handle one record with retries; duplicates are skipped outright.
    pub async fn consume_record(&self, record: &LogRecord) {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !seen.insert(&record.key) {
                counter!(METRIC_UPDATER_DUPLICATES).increment(1);
                debug!(message_id = %record.key, "Duplicate event skipped");
                return;
            }
        }

        let event: ChangeEvent = match serde_json::from_slice(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                counter!(METRIC_UPDATER_ERRORS).increment(1);
                warn!(entry = %record.entry_id, error = %err, "Undecodable change event");
                return;
            }
        };

        for attempt in 0..HANDLER_ATTEMPTS {
            match self.apply(&event).await {
                Ok(()) => {
                    counter!(METRIC_UPDATER_APPLIED).increment(1);
                    return;
                }
                Err(err) if attempt + 1 < HANDLER_ATTEMPTS => {
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt);
                    warn!(
                        event_id = %event.id,
                        attempt = attempt + 1,
                        error = %err,
                        "Event handling failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    counter!(METRIC_UPDATER_ERRORS).increment(1);
                    warn!(
                        event_id = %event.id,
                        error = %err,
                        "Event handling failed after retries; acknowledged to unblock the stream"
                    );
                }
            }
        }
    }

    #[instrument(skip(self, event), fields(entity_id = %event.entity_id, action = ?event.action))]
    async fn apply(&self, event: &ChangeEvent) -> Result<(), crate::cache::CacheError> {
        let key = keys::entity_key(&event.entity_id);

        match event.action {
            ChangeAction::Created => {
                // Warm the positive entry and clear the negative sibling so
                // "known absent" flips to present immediately rather than
                // waiting out the negative TTL.
                if let Some(data) = &event.data {
                    if let Ok(body) = serde_json::to_vec(data) {
                        self.cache.set(&key, &body, None).await;
                    }
                }
                self.cache
                    .substrate()
                    .delete(&[keys::negative_key(&key)])
                    .await?;
            }
            ChangeAction::Updated => {
                match &event.data {
                    // With the fresh payload in hand, warm in place.
                    Some(data) => {
                        if let Ok(body) = serde_json::to_vec(data) {
                            self.cache.set(&key, &body, None).await;
                        }
                    }
                    // Otherwise invalidate and let the next read repopulate.
                    None => {
                        self.cache.delete(&[key.clone()]).await?;
                    }
                }
            }
            ChangeAction::Deleted => {
                self.cache.delete(&[key.clone()]).await?;
                self.cache.set_negative(&key).await;
            }
        }

        // Derived collections: list pages always, tagged patterns when the
        // envelope names them.
        self.cache
            .invalidate_by_pattern(&keys::entity_list_pattern())
            .await?;
        if let Some(metadata) = &event.metadata {
            for tag in &metadata.cache_tags {
                self.cache
                    .invalidate_by_pattern(&keys::tag_pattern(tag))
                    .await?;
            }
        }

        self.fan_out(event).await;
        Ok(())
    }

    /// Real-time notification to the entity's room and the type wildcard.
    /// Failures stay local: the cache update already landed.
    async fn fan_out(&self, event: &ChangeEvent) {
        let message = RealtimeMessage::new(
            event.entity_type.clone(),
            event.entity_id.clone(),
            event.action.as_str(),
            event.data.clone().unwrap_or(serde_json::Value::Null),
        );

        if let Err(err) = self.hub.publish_update(&event.room(), message.clone()).await {
            warn!(room = %event.room(), error = %err, "Realtime publish failed");
        }
        if let Err(err) = self
            .hub
            .publish_update(&event.wildcard_room(), message)
            .await
        {
            warn!(room = %event.wildcard_room(), error = %err, "Wildcard publish failed");
        }
    }
}
