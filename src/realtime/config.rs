//! Real-time hub configuration.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_OUTBOUND_BUFFER: usize = 256;
const DEFAULT_PING_PERIOD_SECS: u64 = 27;
const DEFAULT_PONG_WAIT_SECS: u64 = 60;
const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 512 * 1024;
const DEFAULT_MAX_CONSECUTIVE_DROPS: u32 = 0;

/// Hub and session knobs from `staffetta.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Outbound frames buffered per session before drops begin.
    pub outbound_buffer: usize,
    /// Heartbeat interval, seconds. Must stay below `pong_wait_secs`.
    pub ping_period_secs: u64,
    /// Pong deadline, seconds. A missed pong closes the session.
    pub pong_wait_secs: u64,
    /// Write deadline per frame, seconds.
    pub write_wait_secs: u64,
    /// Maximum inbound frame size, bytes.
    pub max_message_bytes: usize,
    /// Consecutive drops before a session is disconnected; 0 disables the
    /// stricter policy (drops are only counted and logged).
    pub max_consecutive_drops: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            ping_period_secs: DEFAULT_PING_PERIOD_SECS,
            pong_wait_secs: DEFAULT_PONG_WAIT_SECS,
            write_wait_secs: DEFAULT_WRITE_WAIT_SECS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_consecutive_drops: DEFAULT_MAX_CONSECUTIVE_DROPS,
        }
    }
}

impl RealtimeConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs.max(1))
    }

    /// Heartbeat interval, clamped below the pong deadline so a healthy
    /// peer always has a fresh pong in flight before the deadline hits.
    pub fn ping_period(&self) -> Duration {
        let period = Duration::from_secs(self.ping_period_secs.max(1));
        let ceiling = self.pong_wait().mul_f64(0.9);
        period.min(ceiling)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_heartbeat_contract() {
        let config = RealtimeConfig::default();
        assert_eq!(config.ping_period(), Duration::from_secs(27));
        assert_eq!(config.pong_wait(), Duration::from_secs(60));
        assert_eq!(config.max_message_bytes, 512 * 1024);
        assert_eq!(config.outbound_buffer, 256);
    }

    #[test]
    fn ping_period_is_clamped_below_pong_wait() {
        let config = RealtimeConfig {
            ping_period_secs: 120,
            pong_wait_secs: 60,
            ..Default::default()
        };
        assert!(config.ping_period() < config.pong_wait());
    }
}
