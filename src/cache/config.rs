//! Cache configuration.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_BASE_TTL_SECS: u64 = 300;
const DEFAULT_NEGATIVE_TTL_SECS: u64 = 30;
const DEFAULT_JITTER_PCT: f64 = 0.15;
const DEFAULT_SCAN_BATCH: usize = 1000;
const DEFAULT_STATUS_TTL_SECS: u64 = 300;
const DEFAULT_TERMINAL_STATUS_TTL_SECS: u64 = 3600;

/// Cache behavior knobs from `staffetta.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for positive entries, seconds.
    pub base_ttl_secs: u64,
    /// TTL for negative ("known absent") entries, seconds.
    pub negative_ttl_secs: u64,
    /// Symmetric jitter fraction applied to every TTL, 0.0–0.5.
    pub jitter_pct: f64,
    /// Keys deleted per batch during pattern invalidation.
    pub scan_batch: usize,
    /// TTL for cached command-status lookups, seconds.
    pub status_ttl_secs: u64,
    /// TTL for cached terminal command statuses, seconds.
    pub terminal_status_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: DEFAULT_BASE_TTL_SECS,
            negative_ttl_secs: DEFAULT_NEGATIVE_TTL_SECS,
            jitter_pct: DEFAULT_JITTER_PCT,
            scan_batch: DEFAULT_SCAN_BATCH,
            status_ttl_secs: DEFAULT_STATUS_TTL_SECS,
            terminal_status_ttl_secs: DEFAULT_TERMINAL_STATUS_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ttl_secs.max(1))
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs.max(1))
    }

    /// Jitter fraction clamped to a sane range; a value above 0.5 would let
    /// jitter drive TTLs to zero.
    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_pct.clamp(0.0, 0.5)
    }

    pub fn scan_batch(&self) -> usize {
        self.scan_batch.clamp(1, 10_000)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs.max(1))
    }

    pub fn terminal_status_ttl(&self) -> Duration {
        Duration::from_secs(self.terminal_status_ttl_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.base_ttl(), Duration::from_secs(300));
        assert_eq!(config.negative_ttl(), Duration::from_secs(30));
        assert!((config.jitter_fraction() - 0.15).abs() < f64::EPSILON);
        assert_eq!(config.scan_batch(), 1000);
    }

    #[test]
    fn jitter_is_clamped() {
        let config = CacheConfig {
            jitter_pct: 0.9,
            ..Default::default()
        };
        assert!((config.jitter_fraction() - 0.5).abs() < f64::EPSILON);
    }
}
