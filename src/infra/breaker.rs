//! Circuit breaker guarding calls into external collaborators.
//!
//! Failure counting happens inside a rolling window. Once `max_failures`
//! accumulate the breaker opens and callers fail fast with
//! `SERVICE_UNAVAILABLE` semantics; after `reset_time` one probe is
//! admitted (half-open) and a single success closes the circuit again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::error::InfraError;

/// Breaker state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub window: Duration,
    pub reset_time: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(30),
            reset_time: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    window_started_at: Instant,
    opened_at: Instant,
    probe_in_flight: bool,
}

/// Per-collaborator circuit breaker.
pub struct CircuitBreaker {
    service: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            service,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_started_at: now,
                opened_at: now,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Gate a call. `Ok` admits it; `Err` means the circuit is open and the
    /// call must not be attempted.
    pub fn acquire(&self) -> Result<(), InfraError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.config.reset_time {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(service = self.service, "Circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(InfraError::CircuitOpen {
                        service: self.service,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(InfraError::CircuitOpen {
                        service: self.service,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(service = self.service, "Circuit closed after success");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
        inner.window_started_at = Instant::now();
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::HalfOpen => {
                // The probe failed; stay open for another reset window.
                inner.state = BreakerState::Open;
                inner.opened_at = now;
                inner.probe_in_flight = false;
                warn!(service = self.service, "Circuit re-opened after failed probe");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                if now.duration_since(inner.window_started_at) > self.config.window {
                    inner.failures = 0;
                    inner.window_started_at = now;
                }
                inner.failures += 1;
                if inner.failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = now;
                    metrics::counter!(
                        "staffetta_breaker_opened_total",
                        "service" => self.service
                    )
                    .increment(1);
                    warn!(
                        service = self.service,
                        failures = inner.failures,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
