//! Outbox pipeline: idempotent ingest, transactional staging, at-least-once
//! relay publication, per-aggregate FIFO, and the full ingest → execute →
//! event → cache-update flow.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use staffetta::application::entities::{EntityCommandHandler, EntityReadService};
use staffetta::application::ingress::{CommandIngress, IngressConfig, SubmitRequest};
use staffetta::application::relay::{OutboxRelay, RelayConfig};
use staffetta::application::repos::{CommandStore, EntityStore, OutboxStore};
use staffetta::application::updater::{CacheUpdater, UpdaterConfig};
use staffetta::application::validation::CommandValidator;
use staffetta::application::worker::{CommandWorkerPool, WorkerPoolConfig};
use staffetta::cache::{CacheConfig, CacheEngine, CacheStatus};
use staffetta::domain::{
    ChangeEvent, CommandStatus, OutboxMessage, OutboxStatus, TOPIC_COMMANDS, TOPIC_EVENTS,
};
use staffetta::infra::breaker::{BreakerConfig, CircuitBreaker};
use staffetta::infra::db::MemoryStores;
use staffetta::infra::eventlog::{EventLog, EventLogConsumer, MemoryEventLog};
use staffetta::infra::substrate::MemorySubstrate;
use staffetta::realtime::{AllowAllRooms, Hub, RealtimeConfig};

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "event-log",
        BreakerConfig {
            max_failures: 1000,
            ..BreakerConfig::default()
        },
    ))
}

fn ingress_over(stores: Arc<MemoryStores>, cache: Arc<CacheEngine>) -> CommandIngress {
    CommandIngress::new(
        stores,
        Arc::new(CommandValidator::with_entity_rules()),
        cache,
        IngressConfig::default(),
    )
}

fn create_request(entity_id: &str, key: Option<&str>) -> SubmitRequest {
    SubmitRequest {
        command_type: "entity.create".to_string(),
        entity_id: entity_id.to_string(),
        payload: json!({"name": "a"}),
        idempotency_key: key.map(str::to_string),
        subject: None,
        correlation_id: None,
        priority: None,
        max_retries: None,
        timeout_ms: None,
        cache_tags: Vec::new(),
    }
}

// Property 4 / scenario S4: one command row and one outbox row per key.
#[tokio::test]
async fn idempotent_submit_yields_one_command_and_one_outbox_row() {
    let stores = Arc::new(MemoryStores::new());
    let cache = Arc::new(CacheEngine::new(
        Arc::new(MemorySubstrate::new()),
        CacheConfig::default(),
    ));
    let ingress = ingress_over(stores.clone(), cache);

    let first = ingress
        .submit(create_request("e-1", Some("k1")))
        .await
        .unwrap();
    let second = ingress
        .submit(create_request("e-1", Some("k1")))
        .await
        .unwrap();

    assert_eq!(first.command_id, second.command_id);
    assert_eq!(stores.command_count(), 1);
    assert_eq!(stores.outbox_rows().len(), 1);
}

// Property 5: commit → outbox row present; abort → nothing at all.
#[tokio::test]
async fn outbox_write_is_atomic_with_the_business_write() {
    let stores = Arc::new(MemoryStores::new());
    let cache = Arc::new(CacheEngine::new(
        Arc::new(MemorySubstrate::new()),
        CacheConfig::default(),
    ));
    let ingress = ingress_over(stores.clone(), cache);

    stores.set_fail_outbox_insert(true);
    assert!(ingress.submit(create_request("e-1", Some("k2"))).await.is_err());
    assert_eq!(stores.command_count(), 0);
    assert!(stores.outbox_rows().is_empty());

    // The same key submits cleanly once the fault clears: nothing of the
    // aborted attempt survived, including the idempotency mapping.
    let accepted = ingress
        .submit(create_request("e-1", Some("k2")))
        .await
        .unwrap();
    assert_eq!(stores.command_count(), 1);
    assert_eq!(accepted.status, CommandStatus::Pending);
}

// Property 6 / scenario S5: a crash between publish and mark produces a
// duplicate, never a loss.
#[tokio::test]
async fn relay_crash_replays_at_least_once() {
    let stores = Arc::new(MemoryStores::new());
    let log = Arc::new(MemoryEventLog::new());

    let message = OutboxMessage::new(
        "entity",
        "e-5",
        "entity.updated",
        json!({"n": 5}),
        TOPIC_EVENTS,
    );
    stores
        .upsert_entity("e-5", &json!({"n": 5}), &message)
        .await
        .unwrap();

    // First relay instance fetches and publishes, then "crashes" before
    // marking the row.
    let lease = Duration::from_millis(20);
    let fetched = stores.fetch_pending(10, 0, 1, lease).await.unwrap();
    assert_eq!(fetched.len(), 1);
    let payload = serde_json::to_vec(&fetched[0].payload).unwrap();
    log.publish(TOPIC_EVENTS, &fetched[0].id.to_string(), &payload)
        .await
        .unwrap();

    // Lease expires; a fresh relay drains the row again.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let relay = OutboxRelay::new(
        stores.clone(),
        log.clone(),
        breaker(),
        RelayConfig {
            lease,
            ..RelayConfig::default()
        },
    );
    relay.process_batch().await.unwrap();

    let keys = log.keys(TOPIC_EVENTS);
    assert_eq!(keys.len(), 2, "duplicate publication is expected");
    assert_eq!(keys[0], keys[1], "same message id both times");
    assert!(stores
        .outbox_rows()
        .iter()
        .all(|row| row.status == OutboxStatus::Published));
}

// Property 7: per-aggregate FIFO survives hash-partitioned relays.
#[tokio::test]
async fn per_aggregate_fifo_across_partitioned_relays() {
    let stores = Arc::new(MemoryStores::new());
    let log = Arc::new(MemoryEventLog::new());

    let aggregates = ["e-a", "e-b", "e-c", "e-d"];
    for seq in 0..6 {
        for aggregate in aggregates {
            let message = OutboxMessage::new(
                "entity",
                aggregate,
                "entity.updated",
                json!({"aggregate": aggregate, "seq": seq}),
                TOPIC_EVENTS,
            );
            stores
                .upsert_entity(aggregate, &json!({"seq": seq}), &message)
                .await
                .unwrap();
        }
    }

    // Two relay instances share the work by aggregate hash; run them until
    // the backlog drains.
    for partition_index in 0..2 {
        let relay = OutboxRelay::new(
            stores.clone(),
            log.clone(),
            breaker(),
            RelayConfig {
                partition_index,
                partition_count: 2,
                batch_size: 5,
                ..RelayConfig::default()
            },
        );
        while relay.process_batch().await.unwrap() > 0 {}
    }

    assert_eq!(log.records(TOPIC_EVENTS).len(), 24);

    for aggregate in aggregates {
        let sequence: Vec<u64> = log
            .records(TOPIC_EVENTS)
            .iter()
            .filter_map(|record| {
                let value: serde_json::Value = serde_json::from_slice(&record.payload).ok()?;
                (value["aggregate"] == aggregate).then(|| value["seq"].as_u64().unwrap())
            })
            .collect();
        assert_eq!(
            sequence,
            vec![0, 1, 2, 3, 4, 5],
            "aggregate {aggregate} must publish in creation order"
        );
    }
}

// The whole path: ingest → relay → worker → event → updater → cache.
#[tokio::test]
async fn ingest_to_cache_update_end_to_end() {
    let stores = Arc::new(MemoryStores::new());
    let substrate = Arc::new(MemorySubstrate::new());
    let cache = Arc::new(CacheEngine::new(substrate.clone(), CacheConfig::default()));
    let log = Arc::new(MemoryEventLog::new());
    let hub = Arc::new(Hub::new(
        substrate.clone(),
        RealtimeConfig::default(),
        Arc::new(AllowAllRooms),
    ));

    let ingress = ingress_over(stores.clone(), cache.clone());
    let relay = OutboxRelay::new(
        stores.clone(),
        log.clone(),
        breaker(),
        RelayConfig::default(),
    );
    let handler = Arc::new(EntityCommandHandler::new(stores.clone()));
    let pool = CommandWorkerPool::new(stores.clone(), WorkerPoolConfig::default())
        .register("entity.create", handler);
    let command_consumer = Arc::new(log.consumer(vec![TOPIC_COMMANDS.to_string()]));
    let event_consumer = Arc::new(log.consumer(vec![TOPIC_EVENTS.to_string()]));
    let updater = CacheUpdater::new(
        event_consumer.clone(),
        cache.clone(),
        hub,
        UpdaterConfig::default(),
    );

    // 1. Accept the command.
    let accepted = ingress
        .submit(create_request("e-42", Some("k-e2e")))
        .await
        .unwrap();

    // 2. Relay drains the command topic row.
    relay.process_batch().await.unwrap();
    assert_eq!(log.records(TOPIC_COMMANDS).len(), 1);

    // 3. The processor-side worker executes the command.
    let records = command_consumer.poll(10, 0).await.unwrap();
    for record in &records {
        let envelope: staffetta::domain::CommandEnvelope =
            serde_json::from_slice(&record.payload).unwrap();
        let command = stores
            .find_command(envelope.command_id)
            .await
            .unwrap()
            .unwrap();
        pool.execute(command).await;
        command_consumer.ack(record).await.unwrap();
    }

    let settled = stores
        .find_command(accepted.command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, CommandStatus::Completed);
    assert!(stores.find_entity("e-42").await.unwrap().is_some());

    // 4. The handler staged a change event; relay it.
    relay.process_batch().await.unwrap();
    let events = log.records(TOPIC_EVENTS);
    assert_eq!(events.len(), 1);
    let event: ChangeEvent = serde_json::from_slice(&events[0].payload).unwrap();
    assert_eq!(event.entity_id, "e-42");
    assert_eq!(event.event_type(), "entity.created");

    // 5. The updater applies it; the next read is a cache hit.
    for record in event_consumer.poll(10, 0).await.unwrap() {
        updater.consume_record(&record).await;
        event_consumer.ack(&record).await.unwrap();
    }

    let reads = EntityReadService::new(cache, stores.clone());
    let fetched = reads.get("e-42").await.unwrap();
    assert_eq!(fetched.status, CacheStatus::Hit);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&fetched.value.unwrap()).unwrap()["name"],
        "a"
    );
}

// Retention cleanup removes only old published rows.
#[tokio::test]
async fn cleanup_respects_retention() {
    let stores = Arc::new(MemoryStores::new());
    let log = Arc::new(MemoryEventLog::new());

    let message = OutboxMessage::new("entity", "e-1", "entity.updated", json!({}), TOPIC_EVENTS);
    stores
        .upsert_entity("e-1", &json!({}), &message)
        .await
        .unwrap();

    let relay = OutboxRelay::new(
        stores.clone(),
        log.clone(),
        breaker(),
        RelayConfig::default(),
    );
    relay.process_batch().await.unwrap();

    // Fresh rows survive a 7-day retention window...
    assert_eq!(
        stores
            .cleanup_published(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap(),
        0
    );
    // ...and fall to a zero-length one.
    assert_eq!(
        stores.cleanup_published(Duration::ZERO).await.unwrap(),
        1
    );
    assert!(stores.outbox_rows().is_empty());
}
