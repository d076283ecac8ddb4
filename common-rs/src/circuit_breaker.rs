//! # Circuit Breaker
//!
//! A per-target state machine that stops calling a downstream service once it
//! has failed `failure_threshold` times, waits out a cool-down, and then lets a
//! throttled trial call through to probe for recovery.
//!
//! State is held in atomics so readers never block; every transition happens
//! under the breaker's own mutex.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, one trial request per retry window
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures that trips the circuit
    pub failure_threshold: u32,
    /// Reserved: successes required to close from half-open (one success closes today)
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial call is admitted
    pub timeout: Duration,
    /// Minimum spacing between trial calls while half-open
    pub reset_timeout: Duration,
    /// Whether the manager should run the fallback instead of rejecting
    pub enable_fallback: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_millis(60_000),
            reset_timeout: Duration::from_millis(30_000),
            enable_fallback: true,
        }
    }
}

#[derive(Debug)]
struct Timing {
    last_failure: Instant,
    last_retry: Instant,
    last_success: Option<Instant>,
}

/// Point-in-time view of a breaker's counters and timestamps
#[derive(Debug, Clone, Copy)]
pub(crate) struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_activity: Instant,
}

/// Failure-tracking state machine for one downstream target
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    timing: Mutex<Timing>,
    // Set once a failure has actually been recorded; creation stamps last_failure too.
    has_failed: AtomicBool,
}

impl CircuitBreaker {
    /// Creates a new closed circuit breaker for the named target
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();

        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            timing: Mutex::new(Timing {
                last_failure: now,
                last_retry: now,
                last_success: None,
            }),
            has_failed: AtomicBool::new(false),
        }
    }

    /// Returns true if a call may proceed now
    ///
    /// An open circuit whose timeout has elapsed moves to half-open and admits
    /// this one caller. While half-open, at most one caller is admitted per
    /// `reset_timeout` window.
    pub fn can_execute(&self) -> bool {
        if self.state() == CircuitState::Closed {
            return true;
        }

        let mut timing = self.lock_timing();
        let now = Instant::now();

        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_duration_since(timing.last_failure) >= self.config.timeout {
                    self.set_state(CircuitState::HalfOpen);
                    timing.last_retry = now;

                    info!(
                        circuit = %self.name,
                        failures = %self.failure_count(),
                        "Circuit HALF_OPEN: admitting trial call"
                    );
                    true
                } else {
                    debug!(
                        circuit = %self.name,
                        remaining_ms = %self
                            .config
                            .timeout
                            .saturating_sub(now.saturating_duration_since(timing.last_failure))
                            .as_millis(),
                        "Circuit open, request rejected"
                    );
                    false
                }
            }
            CircuitState::HalfOpen => {
                if now.saturating_duration_since(timing.last_retry) >= self.config.reset_timeout {
                    timing.last_retry = now;
                    true
                } else {
                    debug!(circuit = %self.name, "Trial call already in flight, request rejected");
                    false
                }
            }
        }
    }

    /// Records a successful call
    ///
    /// A success while half-open closes the circuit and clears the failure
    /// count; while closed, failures are not decayed.
    pub fn record_success(&self) {
        let mut timing = self.lock_timing();

        if self.state() == CircuitState::HalfOpen {
            self.set_state(CircuitState::Closed);
            self.failure_count.store(0, Ordering::SeqCst);

            info!(circuit = %self.name, "Circuit CLOSED: service recovered");
        }

        self.success_count.fetch_add(1, Ordering::SeqCst);
        timing.last_success = Some(Instant::now());
    }

    /// Records a failed call, opening the circuit once the threshold is reached
    pub fn record_failure(&self) {
        let mut timing = self.lock_timing();

        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        timing.last_failure = Instant::now();
        self.has_failed.store(true, Ordering::SeqCst);

        if failures >= self.config.failure_threshold {
            let previous = self.state();
            self.set_state(CircuitState::Open);

            if previous != CircuitState::Open {
                warn!(
                    circuit = %self.name,
                    failures = %failures,
                    threshold = %self.config.failure_threshold,
                    previous_state = %previous,
                    "Circuit OPEN: failure threshold reached"
                );
            }
        }
    }

    /// Forces the circuit closed and clears all history
    pub fn reset(&self) {
        let mut timing = self.lock_timing();
        let now = Instant::now();
        let previous = self.state();

        self.set_state(CircuitState::Closed);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        timing.last_failure = now;
        timing.last_retry = now;
        self.has_failed.store(false, Ordering::SeqCst);

        info!(
            circuit = %self.name,
            previous_state = %previous,
            "Circuit manually reset to CLOSED state"
        );
    }

    /// Gets the current state without blocking
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Gets the current failure count without blocking
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Gets the total success count without blocking
    pub fn success_count(&self) -> u32 {
        self.success_count.load(Ordering::SeqCst)
    }

    /// Name of the target this breaker protects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the breaker was created with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        let timing = self.lock_timing();
        let last_failure = self.has_failed.load(Ordering::SeqCst).then_some(timing.last_failure);
        let last_activity = match timing.last_success {
            Some(success) => success.max(timing.last_failure),
            None => timing.last_failure,
        };

        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count(),
            success_count: self.success_count(),
            last_failure,
            last_success: timing.last_success,
            last_activity,
        }
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn lock_timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_millis(1000),
            reset_timeout: Duration::from_millis(500),
            ..CircuitBreakerConfig::default()
        }
    }

    #[test]
    fn test_circuit_closed_initially() {
        let cb = CircuitBreaker::new("user-service", CircuitBreakerConfig::default());

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        for threshold in 1..=6 {
            let cb = CircuitBreaker::new("user-service", test_config(threshold));

            for _ in 0..threshold - 1 {
                cb.record_failure();
            }
            assert_eq!(cb.state(), CircuitState::Closed);
            assert!(cb.can_execute());

            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Open);
            assert!(!cb.can_execute());
        }
    }

    #[test]
    fn test_success_does_not_decay_failures_when_closed() {
        let cb = CircuitBreaker::new("user-service", test_config(3));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 2);
        assert_eq!(cb.success_count(), 1);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_stays_closed_to_traffic_until_timeout() {
        let cb = CircuitBreaker::new("user-service", test_config(1));
        cb.record_failure();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_per_window() {
        let cb = CircuitBreaker::new("user-service", test_config(1));
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1000)).await;

        assert!(cb.can_execute());
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.can_execute());
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_half_open_closes_circuit() {
        let cb = CircuitBreaker::new("user-service", test_config(2));
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens_circuit() {
        let cb = CircuitBreaker::new("user-service", test_config(2));
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);

        // The re-stamped failure time restarts the cool-down.
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new("user-service", test_config(1));
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let cb = Arc::new(CircuitBreaker::new("user-service", test_config(50)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cb.failure_count(), 200);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_snapshot_tracks_activity() {
        let cb = CircuitBreaker::new("user-service", test_config(5));
        let fresh = cb.snapshot();
        assert!(fresh.last_failure.is_none());
        assert!(fresh.last_success.is_none());

        cb.record_failure();
        cb.record_success();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.success_count, 1);
        assert!(snapshot.last_failure.is_some());
        assert_eq!(snapshot.last_success.map(|s| s >= snapshot.last_activity), Some(true));
    }
}
