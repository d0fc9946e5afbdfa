//! Per-provider circuit breaker.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: `failure_threshold` consecutive failures seen; calls are
//!   skipped without touching the network until the cool-down elapses
//! - **HalfOpen**: cool-down elapsed; up to `half_open_max_trials` trial
//!   calls are let through. A trial success closes the breaker, a trial
//!   failure reopens it immediately.
//!
//! Time is read from `tokio::time::Instant` so tests can drive cool-downs
//! with a paused clock.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub cool_down_ms: u64,
    /// Maximum number of concurrent trial calls in half-open state
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

/// Admission ticket handed out by [`CircuitBreaker::try_acquire`].
///
/// Outcomes must be reported with the permit so a late result from a call
/// admitted before a state change cannot be mistaken for a trial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub trial: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    last_state_change: DateTime<Utc>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_in_flight: 0,
                last_state_change: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current state as stored. An open breaker whose cool-down has elapsed
    /// still reports `Open` until the next acquisition moves it on.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.lock();
        BreakerSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            last_state_change: s.last_state_change,
        }
    }

    /// Whether a call would currently be let through.
    pub fn is_available(&self) -> bool {
        let s = self.lock();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cool_down_elapsed(&s, Instant::now()),
            CircuitState::HalfOpen => s.trials_in_flight < self.config.half_open_max_trials,
        }
    }

    /// Whether the breaker is open and still cooling down.
    pub fn in_cool_down(&self) -> bool {
        let s = self.lock();
        s.state == CircuitState::Open && !self.cool_down_elapsed(&s, Instant::now())
    }

    fn cool_down_elapsed(&self, s: &BreakerState, now: Instant) -> bool {
        s.opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cool_down())
    }

    /// Ask to place a call. `None` means skip this provider.
    pub fn try_acquire(&self) -> Option<Permit> {
        let now = Instant::now();
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => Some(Permit { trial: false }),
            CircuitState::Open => {
                if self.cool_down_elapsed(&s, now) {
                    self.transition(&mut s, CircuitState::HalfOpen);
                    s.trials_in_flight = 1;
                    Some(Permit { trial: true })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if s.trials_in_flight < self.config.half_open_max_trials {
                    s.trials_in_flight += 1;
                    Some(Permit { trial: true })
                } else {
                    None
                }
            }
        }
    }

    pub fn on_success(&self, permit: Permit) {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => s.consecutive_failures = 0,
            CircuitState::HalfOpen if permit.trial => {
                s.consecutive_failures = 0;
                s.trials_in_flight = 0;
                s.opened_at = None;
                self.transition(&mut s, CircuitState::Closed);
                info!(provider = %self.name, "circuit closed after successful trial");
            }
            // Late result from a call admitted before the breaker tripped.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self, permit: Permit) {
        let now = Instant::now();
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.opened_at = Some(now);
                    self.transition(&mut s, CircuitState::Open);
                    warn!(
                        provider = %self.name,
                        failures = s.consecutive_failures,
                        cool_down_ms = self.config.cool_down_ms,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if permit.trial => {
                s.consecutive_failures += 1;
                s.trials_in_flight = 0;
                s.opened_at = Some(now);
                self.transition(&mut s, CircuitState::Open);
                warn!(provider = %self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Give back a trial permit whose call never happened.
    pub fn release(&self, permit: Permit) {
        if permit.trial {
            let mut s = self.lock();
            if s.state == CircuitState::HalfOpen {
                s.trials_in_flight = s.trials_in_flight.saturating_sub(1);
            }
        }
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState) {
        if s.state == to {
            return;
        }
        s.state = to;
        s.last_state_change = Utc::now();
        metrics::counter!(
            crate::telemetry::BREAKER_TRANSITIONS_TOTAL,
            "provider" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "primary",
            BreakerConfig {
                failure_threshold: threshold,
                cool_down_ms: 1_000,
                half_open_max_trials: 1,
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        let permit = b.try_acquire().expect("call should be admitted");
        b.on_failure(permit);
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker(3);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.is_available());
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let b = breaker(3);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_none());
        assert_eq!(b.snapshot().consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3);
        fail(&b);
        fail(&b);
        let p = b.try_acquire().unwrap();
        b.on_success(p);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cool_down_then_close() {
        let b = breaker(2);
        fail(&b);
        fail(&b);
        assert!(b.in_cool_down());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(b.try_acquire().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let trial = b.try_acquire().expect("trial admitted");
        assert!(trial.trial);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(b.try_acquire().is_none());

        b.on_success(trial);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let b = breaker(1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(2)).await;
        let trial = b.try_acquire().unwrap();
        b.on_failure(trial);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_none());

        // Cool-down restarts from the trial failure.
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(b.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_does_not_close_half_open() {
        let b = breaker(1);
        let early = b.try_acquire().unwrap();
        fail(&b);
        tokio::time::advance(Duration::from_secs(2)).await;
        let trial = b.try_acquire().unwrap();

        // Result of a call admitted while closed arrives now.
        b.on_success(early);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.release(trial);
        assert!(b.try_acquire().is_some());
    }
}
