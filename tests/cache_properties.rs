//! Cache engine behavior: single-flight coalescing, TTL jitter bounds,
//! negative caching, and pattern invalidation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use staffetta::cache::{keys, CacheConfig, CacheEngine, CacheError, CacheStatus, Lookup};
use staffetta::infra::substrate::MemorySubstrate;

fn engine_with_substrate() -> (Arc<CacheEngine>, Arc<MemorySubstrate>) {
    let substrate = Arc::new(MemorySubstrate::new());
    let engine = Arc::new(CacheEngine::new(
        substrate.clone(),
        CacheConfig::default(),
    ));
    (engine, substrate)
}

async fn assert_single_flight(concurrency: usize) {
    let (engine, _) = engine_with_substrate();
    let loads = Arc::new(AtomicUsize::new(0));
    let key = keys::entity_key("e-43");

    let mut handles = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let engine = engine.clone();
        let loads = loads.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            engine
                .get_or_fetch(&key, move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Some(Bytes::from_static(b"{\"n\":\"y\"}")))
                })
                .await
        }));
    }

    let mut saw_miss = false;
    for handle in handles {
        let fetched = handle.await.unwrap().unwrap();
        assert_eq!(fetched.value, Some(Bytes::from_static(b"{\"n\":\"y\"}")));
        if fetched.status == CacheStatus::Miss {
            saw_miss = true;
        }
    }

    assert_eq!(
        loads.load(Ordering::SeqCst),
        1,
        "exactly one loader invocation for {concurrency} concurrent callers"
    );
    assert!(saw_miss, "at least one caller observes the miss");

    // A subsequent read within the TTL is a hit without loading.
    let fetched = engine
        .get_or_fetch(&key, || async { panic!("loader must not run on hit") })
        .await
        .unwrap();
    assert_eq!(fetched.status, CacheStatus::Hit);
}

#[tokio::test]
async fn single_flight_coalesces_two() {
    assert_single_flight(2).await;
}

#[tokio::test]
async fn single_flight_coalesces_sixteen() {
    assert_single_flight(16).await;
}

#[tokio::test]
async fn single_flight_coalesces_one_hundred_twenty_eight() {
    assert_single_flight(128).await;
}

#[tokio::test]
async fn loader_error_propagates_to_every_waiter() {
    let (engine, _) = engine_with_substrate();
    let key = keys::entity_key("e-err");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            engine
                .get_or_fetch(&key, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(CacheError::Loader("origin down".into()))
                })
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    // No cache mutation happened: the key is still a plain miss.
    assert_eq!(engine.get(&key).await.unwrap(), Lookup::Miss);
}

#[tokio::test]
async fn negative_cache_suppresses_loader() {
    let (engine, _) = engine_with_substrate();
    let loads = Arc::new(AtomicUsize::new(0));
    let key = keys::entity_key("e-44");

    // First request: loader reports not-found.
    let loads_clone = loads.clone();
    let first = engine
        .get_or_fetch(&key, move || async move {
            loads_clone.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await
        .unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert!(first.value.is_none());

    // Within the negative TTL every request answers from the marker.
    for _ in 0..5 {
        let fetched = engine
            .get_or_fetch(&key, || async {
                panic!("loader must not run while the negative entry lives")
            })
            .await
            .unwrap();
        assert_eq!(fetched.status, CacheStatus::Negative);
        assert!(fetched.value.is_none());
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pattern_invalidation_is_complete_and_exact() {
    let (engine, substrate) = engine_with_substrate();

    for i in 0..2500 {
        engine
            .set(&keys::entity_key(&format!("e-{i}")), b"x", None)
            .await;
    }
    engine.set("stf:v1:tag:keep", b"keep", None).await;

    let deleted = engine
        .invalidate_by_pattern("stf:v1:entity:*")
        .await
        .unwrap();
    // Every entity key and its absent :neg siblings were never written, so
    // the count is exactly the 2500 positive entries.
    assert_eq!(deleted, 2500);

    assert!(matches!(
        engine.get("stf:v1:tag:keep").await.unwrap(),
        Lookup::Hit(_)
    ));
    assert_eq!(substrate.len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Stored expiry stays inside base_ttl ± 15% for every default-TTL set.
    #[test]
    fn jitter_stays_within_fifteen_percent(base_secs in 10u64..50_000) {
        let substrate = Arc::new(MemorySubstrate::new());
        let config = CacheConfig {
            base_ttl_secs: base_secs,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(substrate.clone(), config);

        futures::executor::block_on(async {
            engine.set("stf:v1:entity:p", b"x", None).await;
        });

        let ttl = substrate.ttl_of("stf:v1:entity:p").expect("entry written");
        let base = Duration::from_secs(base_secs);
        let low = base.mul_f64(0.85).saturating_sub(Duration::from_secs(1));
        let high = base.mul_f64(1.15) + Duration::from_secs(1);
        prop_assert!(ttl >= low, "ttl {ttl:?} below {low:?}");
        prop_assert!(ttl <= high, "ttl {ttl:?} above {high:?}");
    }

    // Explicit TTLs are jittered symmetrically too.
    #[test]
    fn explicit_ttl_is_also_jittered(ttl_secs in 10u64..10_000) {
        let substrate = Arc::new(MemorySubstrate::new());
        let engine = CacheEngine::new(substrate.clone(), CacheConfig::default());

        futures::executor::block_on(async {
            engine
                .set(
                    "stf:v1:entity:q",
                    b"x",
                    Some(Duration::from_secs(ttl_secs)),
                )
                .await;
        });

        let stored = substrate.ttl_of("stf:v1:entity:q").expect("entry written");
        let base = Duration::from_secs(ttl_secs);
        let low = base.mul_f64(0.85).saturating_sub(Duration::from_secs(1));
        let high = base.mul_f64(1.15) + Duration::from_secs(1);
        prop_assert!(stored >= low && stored <= high);
    }
}
