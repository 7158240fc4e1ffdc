//! Per-indexer circuit breaker.
//!
//! Three states: `Closed` (calls allowed), `Open` (calls refused until the
//! recovery timeout elapses since the trip), `HalfOpen` (the next call is a
//! probe). Time is passed in by the caller so tests control the clock.

use chrono::{DateTime, Duration, Utc};

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before `Closed` trips to `Open`.
    pub failure_threshold: u32,
    /// Wait after a trip before a half-open probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    /// Rebuild breaker position from a persisted consecutive-failure count
    /// (used after a restart, from recent health samples).
    pub fn restore(config: BreakerConfig, consecutive_failures: u32) -> Self {
        let state = if consecutive_failures >= config.failure_threshold {
            BreakerState::Open
        } else {
            BreakerState::Closed
        };
        Self {
            config,
            state,
            consecutive_failures,
            last_failure_at: (consecutive_failures > 0).then(Utc::now),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a call may proceed right now. Moves `Open` to `HalfOpen`
    /// once the recovery timeout has elapsed.
    pub fn allows_request(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| now - at >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
        match self.state {
            // A half-open probe failure re-opens immediately.
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            BreakerState::Closed | BreakerState::Open => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
        }
    }

    /// Operator/recovery reset back to `Closed`.
    pub fn reset(&mut self) {
        self.record_success();
    }
}
