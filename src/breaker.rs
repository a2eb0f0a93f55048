//! Circuit breaker gating delivery attempts
//!
//! Three states:
//! - **Closed**: attempts pass through
//! - **Open**: attempts are refused until `open_duration` has elapsed since
//!   the last failure
//! - **HalfOpen**: a single trial attempt is allowed; its success closes the
//!   circuit, its failure reopens it and restarts the timer
//!
//! The Open → HalfOpen transition happens lazily inside [`CircuitBreaker::can_attempt`].

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::Open => f.write_str("open"),
            BreakerState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// How long the circuit stays open after the last failure
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// State and failure count read together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// When the current half-open trial was granted
    trial_started_at: Option<Instant>,
}

/// Three-state gate over delivery attempts
///
/// One instance per delivery target. All operations take a single internal
/// mutex; none of them block on I/O.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                trial_started_at: None,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether a delivery attempt may be made now
    ///
    /// Moves Open → HalfOpen once `open_duration` has passed since the last
    /// failure, granting that caller the trial attempt. While the trial is
    /// outstanding further callers are refused; a trial that never reports
    /// back is forgotten after another `open_duration`.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    tracing::info!(
                        failures = inner.consecutive_failures,
                        "Circuit breaker half-open, allowing trial attempt"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => match inner.trial_started_at {
                Some(at) if now.saturating_duration_since(at) < self.config.open_duration => false,
                _ => {
                    inner.trial_started_at = Some(now);
                    true
                }
            },
        }
    }

    /// Record a successful attempt: reset failures and close the circuit
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("Circuit breaker closed");
        }
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
        inner.trial_started_at = None;
    }

    /// Record a failed attempt, opening the circuit at the threshold
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.trial_started_at = None;

        let reopen = inner.state == BreakerState::HalfOpen;
        if reopen || inner.consecutive_failures >= self.config.failure_threshold {
            if inner.state != BreakerState::Open {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    open_secs = self.config.open_duration.as_secs(),
                    "Circuit breaker opened"
                );
            }
            inner.state = BreakerState::Open;
        }
    }

    /// Current state, without triggering the lazy Open → HalfOpen transition
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// State and failure count under a single lock
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    // Nothing inside the critical sections can panic, so a poisoned lock
    // still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
