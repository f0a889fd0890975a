//! Cache-aside engine over the shared substrate.
//!
//! Implements the read path: jittered TTLs, negative entries, single-flight
//! loads, and incremental pattern invalidation. Correctness never depends
//! on an individual write succeeding; set failures are logged and
//! swallowed, get failures degrade to a miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infra::substrate::{Substrate, SubstrateError};

use super::config::CacheConfig;
use super::flight::FlightGroup;
use super::keys::negative_key;

const METRIC_CACHE_HITS: &str = "staffetta_cache_hits_total";
const METRIC_CACHE_MISSES: &str = "staffetta_cache_misses_total";
const METRIC_CACHE_GET_SECONDS: &str = "staffetta_cache_get_seconds";
const METRIC_CACHE_LOADS: &str = "staffetta_cache_loads_total";

/// Cloneable error shared between single-flight waiters.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("substrate error: {0}")]
    Substrate(String),
    #[error("loader failed: {0}")]
    Loader(String),
    /// The loader's collaborator is behind an open circuit; constructed by
    /// callers, never by the engine itself.
    #[error("downstream circuit open: {0}")]
    CircuitOpen(&'static str),
}

impl From<SubstrateError> for CacheError {
    fn from(err: SubstrateError) -> Self {
        Self::Substrate(err.to_string())
    }
}

/// Outcome of a bare `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    Negative,
    Miss,
}

/// Where a served value came from; surfaces as the `Cache-Status` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Negative,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Negative => "negative",
        }
    }
}

/// Result of a read-through fetch. `value` is `None` when the entity is
/// known absent (loader said not-found, or a negative entry was hit).
#[derive(Debug, Clone)]
pub struct Fetched {
    pub value: Option<Bytes>,
    pub status: CacheStatus,
}

type FlightOutcome = Result<Fetched, CacheError>;

/// Cache engine: process-local API over a cluster-shared substrate.
pub struct CacheEngine {
    substrate: Arc<dyn Substrate>,
    config: CacheConfig,
    flight: FlightGroup<FlightOutcome>,
}

impl CacheEngine {
    pub fn new(substrate: Arc<dyn Substrate>, config: CacheConfig) -> Self {
        Self {
            substrate,
            config,
            flight: FlightGroup::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Look a key up, consulting the negative sibling on absence.
    ///
    /// Substrate failures surface as `Err`; callers treat that as a miss
    /// and may proceed to origin with stricter timeouts.
    pub async fn get(&self, key: &str) -> Result<Lookup, CacheError> {
        let started_at = Instant::now();
        let result = self.get_inner(key).await;
        histogram!(METRIC_CACHE_GET_SECONDS).record(started_at.elapsed().as_secs_f64());
        result
    }

    async fn get_inner(&self, key: &str) -> Result<Lookup, CacheError> {
        match self.substrate.get(key).await {
            Ok(Some(value)) => {
                counter!(METRIC_CACHE_HITS).increment(1);
                return Ok(Lookup::Hit(value));
            }
            Ok(None) => {}
            Err(err) => {
                counter!(METRIC_CACHE_MISSES).increment(1);
                return Err(err.into());
            }
        }

        // The positive key shadows the negative sibling: only consult the
        // sibling once the base key is known absent.
        match self.substrate.get(&negative_key(key)).await {
            Ok(Some(_)) => {
                counter!(METRIC_CACHE_HITS).increment(1);
                Ok(Lookup::Negative)
            }
            Ok(None) => {
                counter!(METRIC_CACHE_MISSES).increment(1);
                Ok(Lookup::Miss)
            }
            Err(err) => {
                counter!(METRIC_CACHE_MISSES).increment(1);
                Err(err.into())
            }
        }
    }

    /// Store a value under the default or an explicit TTL, jittered either
    /// way so synchronized expiry storms cannot form.
    ///
    /// Failures are logged and swallowed; the next read degrades to a miss.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let ttl = self.jittered(ttl.unwrap_or_else(|| self.config.base_ttl()));
        if let Err(err) = self.substrate.set(key, value, ttl).await {
            warn!(key, error = %err, "Cache set failed; continuing without cache");
        }
    }

    /// Write the negative sibling marking the key as known absent.
    pub async fn set_negative(&self, key: &str) {
        let neg = negative_key(key);
        if let Err(err) = self
            .substrate
            .set(&neg, b"1", self.config.negative_ttl())
            .await
        {
            warn!(key = %neg, error = %err, "Negative cache set failed");
        }
    }

    /// Remove keys and their negative siblings.
    pub async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut all = Vec::with_capacity(keys.len() * 2);
        for key in keys {
            all.push(key.clone());
            all.push(negative_key(key));
        }
        Ok(self.substrate.delete(&all).await?)
    }

    /// Cache-aside read with single-flight coalescing.
    ///
    /// Exactly one loader runs per absent key at a time; concurrent callers
    /// observe the winner's outcome. A not-found loader result writes a
    /// negative entry; a loader error leaves the cache untouched and
    /// propagates to every waiter.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, loader: F) -> Result<Fetched, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Bytes>, CacheError>>,
    {
        match self.get(key).await {
            Ok(Lookup::Hit(value)) => {
                return Ok(Fetched {
                    value: Some(value),
                    status: CacheStatus::Hit,
                })
            }
            Ok(Lookup::Negative) => {
                return Ok(Fetched {
                    value: None,
                    status: CacheStatus::Negative,
                })
            }
            Ok(Lookup::Miss) => {}
            Err(err) => {
                debug!(key, error = %err, "Cache get failed; falling through to origin");
            }
        }

        let (outcome, led) = self
            .flight
            .run(key, || async {
                // Double-check after winning the slot: a previous leader may
                // have populated the key while this caller queued.
                match self.get(key).await {
                    Ok(Lookup::Hit(value)) => {
                        return Ok(Fetched {
                            value: Some(value),
                            status: CacheStatus::Hit,
                        })
                    }
                    Ok(Lookup::Negative) => {
                        return Ok(Fetched {
                            value: None,
                            status: CacheStatus::Negative,
                        })
                    }
                    Ok(Lookup::Miss) | Err(_) => {}
                }

                debug!(key, "Cache miss, loading from origin");
                counter!(METRIC_CACHE_LOADS).increment(1);

                match loader().await {
                    Ok(Some(value)) => {
                        self.set(key, &value, None).await;
                        Ok(Fetched {
                            value: Some(value),
                            status: CacheStatus::Miss,
                        })
                    }
                    Ok(None) => {
                        self.set_negative(key).await;
                        Ok(Fetched {
                            value: None,
                            status: CacheStatus::Miss,
                        })
                    }
                    Err(err) => Err(err),
                }
            })
            .await;

        if !led {
            debug!(key, "Joined in-flight load");
        }
        outcome
    }

    /// Delete every key matching a glob pattern, in batches.
    ///
    /// Walks the substrate with an incremental scan so memory stays bounded
    /// regardless of how many keys match. Returns the number deleted.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let batch_size = self.config.scan_batch();
        let mut cursor = 0u64;
        let mut batch: Vec<String> = Vec::with_capacity(batch_size);
        let mut deleted = 0u64;

        loop {
            let (next, keys) = self.substrate.scan(pattern, cursor, batch_size).await?;
            batch.extend(keys);

            if batch.len() >= batch_size {
                deleted += self.substrate.delete(&batch).await?;
                batch.clear();
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        if !batch.is_empty() {
            deleted += self.substrate.delete(&batch).await?;
        }

        info!(pattern, deleted, "Invalidated cache keys");
        Ok(deleted)
    }

    /// Apply symmetric jitter: `ttl ± jitter_pct`.
    fn jittered(&self, ttl: Duration) -> Duration {
        let fraction = self.config.jitter_fraction();
        if fraction <= f64::EPSILON {
            return ttl;
        }
        let spread = rand::thread_rng().gen_range(-fraction..=fraction);
        ttl.mul_f64(1.0 + spread)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::infra::substrate::MemorySubstrate;

    use super::*;

    fn engine() -> CacheEngine {
        CacheEngine::new(Arc::new(MemorySubstrate::new()), CacheConfig::default())
    }

    #[tokio::test]
    async fn get_miss_then_hit() {
        let engine = engine();
        assert_eq!(engine.get("stf:v1:entity:e-1").await.unwrap(), Lookup::Miss);

        engine.set("stf:v1:entity:e-1", b"{}", None).await;
        match engine.get("stf:v1:entity:e-1").await.unwrap() {
            Lookup::Hit(value) => assert_eq!(value, Bytes::from_static(b"{}")),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negative_entry_reported_until_shadowed() {
        let engine = engine();
        engine.set_negative("stf:v1:entity:e-2").await;
        assert_eq!(
            engine.get("stf:v1:entity:e-2").await.unwrap(),
            Lookup::Negative
        );

        // A positive write shadows the sibling without deleting it.
        engine.set("stf:v1:entity:e-2", b"{}", None).await;
        assert!(matches!(
            engine.get("stf:v1:entity:e-2").await.unwrap(),
            Lookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn jitter_stays_within_bounds() {
        let substrate = Arc::new(MemorySubstrate::new());
        let config = CacheConfig::default();
        let base = config.base_ttl();
        let engine = CacheEngine::new(substrate.clone(), config);

        for i in 0..200 {
            let key = format!("stf:v1:entity:e-{i}");
            engine.set(&key, b"x", None).await;
            let ttl = substrate.ttl_of(&key).expect("entry just written");
            let low = base.mul_f64(0.85) - Duration::from_secs(1);
            let high = base.mul_f64(1.15) + Duration::from_secs(1);
            assert!(ttl >= low && ttl <= high, "ttl {ttl:?} outside [{low:?}, {high:?}]");
        }
    }

    #[tokio::test]
    async fn get_or_fetch_loads_once_and_caches() {
        let engine = Arc::new(engine());
        let loads = Arc::new(AtomicUsize::new(0));

        let loads_clone = loads.clone();
        let fetched = engine
            .get_or_fetch("stf:v1:entity:e-3", || async move {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Bytes::from_static(b"{\"n\":\"y\"}")))
            })
            .await
            .unwrap();
        assert_eq!(fetched.status, CacheStatus::Miss);
        assert_eq!(fetched.value, Some(Bytes::from_static(b"{\"n\":\"y\"}")));

        // Second read is a hit; the loader does not run again.
        let fetched = engine
            .get_or_fetch("stf:v1:entity:e-3", || async {
                panic!("loader must not run on hit")
            })
            .await
            .unwrap();
        assert_eq!(fetched.status, CacheStatus::Hit);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_writes_negative_entry() {
        let engine = engine();
        let fetched = engine
            .get_or_fetch("stf:v1:entity:e-4", || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(fetched.status, CacheStatus::Miss);
        assert!(fetched.value.is_none());

        // Within the negative TTL the loader is suppressed entirely.
        let fetched = engine
            .get_or_fetch("stf:v1:entity:e-4", || async {
                panic!("loader must not run while the negative entry lives")
            })
            .await
            .unwrap();
        assert_eq!(fetched.status, CacheStatus::Negative);
    }

    #[tokio::test]
    async fn loader_error_leaves_cache_untouched() {
        let engine = engine();
        let result = engine
            .get_or_fetch("stf:v1:entity:e-5", || async {
                Err(CacheError::Loader("origin down".into()))
            })
            .await;
        assert!(result.is_err());

        // No value, no negative entry: the next read tries again.
        assert_eq!(engine.get("stf:v1:entity:e-5").await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn delete_removes_negative_sibling_too() {
        let engine = engine();
        engine.set("stf:v1:entity:e-6", b"x", None).await;
        engine.set_negative("stf:v1:entity:e-6").await;

        engine
            .delete(&["stf:v1:entity:e-6".to_string()])
            .await
            .unwrap();
        assert_eq!(engine.get("stf:v1:entity:e-6").await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn pattern_invalidation_is_exact() {
        let substrate = Arc::new(MemorySubstrate::new());
        let engine = CacheEngine::new(substrate.clone(), CacheConfig::default());

        for i in 0..50 {
            engine
                .set(&format!("stf:v1:entities:qhash:{i:x}"), b"page", None)
                .await;
        }
        engine.set("stf:v1:entity:e-1", b"keep", None).await;

        let deleted = engine
            .invalidate_by_pattern("stf:v1:entities:qhash:*")
            .await
            .unwrap();
        assert_eq!(deleted, 50);
        assert!(matches!(
            engine.get("stf:v1:entity:e-1").await.unwrap(),
            Lookup::Hit(_)
        ));
    }
}

