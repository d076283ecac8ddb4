//! # Circuit Breaker Manager
//!
//! Owns one [`CircuitBreaker`] per logical service name and wraps calls so
//! callers never touch breaker bookkeeping themselves.
//!
//! Primary and fallback closures always run outside the registry lock, so they
//! may call back into the manager or into discovery freely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::CircuitBreakerError;

/// Default idle period after which a closed breaker is evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default period of the background idle sweep
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Snapshot of one breaker for external scrapers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time since the last recorded failure
    pub last_failure_time: Option<Duration>,
    /// Time since the last recorded success
    pub last_success_time: Option<Duration>,
}

impl Default for CircuitBreakerStats {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
        }
    }
}

/// A guarded call's value, tagged with whether the fallback produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guarded<T> {
    pub value: T,
    pub from_fallback: bool,
}

/// Registry of per-service circuit breakers
#[derive(Debug)]
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    idle_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), DEFAULT_IDLE_TIMEOUT)
    }
}

impl CircuitBreakerManager {
    /// Creates an empty manager
    ///
    /// `idle_timeout` is how long a closed breaker may go without activity
    /// before the cleanup sweep evicts it.
    pub fn new(default_config: CircuitBreakerConfig, idle_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            default_config,
            idle_timeout,
            breakers: Mutex::new(HashMap::new()),
            worker_handle: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Config used by callers that have no per-service override
    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Returns the breaker for `name`, creating it with `config` if absent
    ///
    /// An existing breaker keeps the config it was created with.
    pub fn get_circuit_breaker(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock_breakers();
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::new(name, config.clone()));
        breakers.insert(name.to_string(), Arc::clone(&breaker));

        debug!(
            circuit = %name,
            failure_threshold = %config.failure_threshold,
            timeout_ms = %config.timeout.as_millis(),
            "Circuit breaker created"
        );
        breaker
    }

    /// Runs `primary` behind the breaker for `name`
    ///
    /// When the breaker denies the call and `config.enable_fallback` is set,
    /// the fallback's value is returned as an ordinary success. A failing
    /// primary is recorded and its error handed back untouched.
    pub fn execute<T, E, F, G>(
        &self,
        name: &str,
        primary: F,
        fallback: G,
        config: &CircuitBreakerConfig,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        self.run(name, primary, Some(fallback), config)
            .map(|guarded| guarded.value)
    }

    /// Like [`execute`](Self::execute), but reports whether the fallback answered
    pub fn execute_with_outcome<T, E, F, G>(
        &self,
        name: &str,
        primary: F,
        fallback: G,
        config: &CircuitBreakerConfig,
    ) -> Result<Guarded<T>, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        self.run(name, primary, Some(fallback), config)
    }

    /// Runs `primary` behind the breaker with no fallback; a denial is always `Open`
    pub fn execute_guarded<T, E, F>(
        &self,
        name: &str,
        primary: F,
        config: &CircuitBreakerConfig,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.run(name, primary, None::<fn() -> T>, config)
            .map(|guarded| guarded.value)
    }

    /// Async form of [`execute`](Self::execute)
    ///
    /// A denied `primary` future is dropped without being polled.
    pub async fn execute_async<T, E, Fut, G>(
        &self,
        name: &str,
        primary: Fut,
        fallback: G,
        config: &CircuitBreakerConfig,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> T,
    {
        let breaker = self.get_circuit_breaker(name, config);

        if !Self::admits(&breaker) {
            return Self::deny(name, Some(fallback), config).map(|guarded| guarded.value);
        }

        Self::observe(&breaker, primary.await)
    }

    /// Forces the breaker for `name` closed; returns false if none exists
    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        let breaker = self.lock_breakers().get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Replaces the breaker for `name` with a fresh one using `config`
    ///
    /// History is discarded; the new breaker starts closed.
    pub fn reconfigure_circuit_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        let previous = self
            .lock_breakers()
            .insert(name.to_string(), Arc::clone(&breaker));

        info!(
            circuit = %name,
            previous_state = %previous.map_or(CircuitState::Closed, |b| b.state()),
            failure_threshold = %breaker.config().failure_threshold,
            "Circuit breaker reconfigured"
        );
        breaker
    }

    /// State of the breaker for `name`; CLOSED if it was never used
    pub fn get_circuit_breaker_state(&self, name: &str) -> CircuitState {
        self.lock_breakers()
            .get(name)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Stats for `name`; zeroed CLOSED stats if it was never used
    pub fn get_circuit_breaker_stats(&self, name: &str) -> CircuitBreakerStats {
        let breaker = self.lock_breakers().get(name).cloned();
        breaker.map(|b| stats_of(&b)).unwrap_or_default()
    }

    /// Stats for every breaker currently held
    pub fn get_all_circuit_breaker_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock_breakers().values().cloned().collect();
        breakers
            .iter()
            .map(|b| (b.name().to_string(), stats_of(b)))
            .collect()
    }

    /// Evicts closed breakers idle for longer than the idle timeout
    ///
    /// Open and half-open breakers are always kept. Returns the number evicted.
    pub fn cleanup_inactive_circuit_breakers(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let mut breakers = self.lock_breakers();
        let before = breakers.len();

        breakers.retain(|name, breaker| {
            let snapshot = breaker.snapshot();
            let idle = now.saturating_duration_since(snapshot.last_activity);
            let evict = snapshot.state == CircuitState::Closed && idle > idle_timeout;

            if evict {
                debug!(circuit = %name, idle_secs = %idle.as_secs(), "Evicting idle circuit breaker");
            }
            !evict
        });

        let evicted = before - breakers.len();
        if evicted > 0 {
            info!(evicted = %evicted, remaining = %breakers.len(), "Cleaned up inactive circuit breakers");
        }
        evicted
    }

    /// Starts the periodic idle sweep; a no-op if it is already running
    ///
    /// The first sweep happens one `interval` after the call.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) {
        let mut worker_handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Circuit breaker cleanup already running");
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Circuit breaker cleanup shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.cleanup_inactive_circuit_breakers();
                    }
                }
            }
        });

        *worker_handle = Some(handle);
        info!(interval_secs = %interval.as_secs(), "Circuit breaker cleanup started");
    }

    /// Stops the idle sweep and waits for it to finish
    pub async fn stop_cleanup(&self) {
        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Circuit breaker cleanup ended abnormally");
        }
    }

    fn run<T, E, F, G>(
        &self,
        name: &str,
        primary: F,
        fallback: Option<G>,
        config: &CircuitBreakerConfig,
    ) -> Result<Guarded<T>, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        let breaker = self.get_circuit_breaker(name, config);

        if !Self::admits(&breaker) {
            return Self::deny(name, fallback, config);
        }

        Self::observe(&breaker, primary()).map(|value| Guarded {
            value,
            from_fallback: false,
        })
    }

    // Only an OPEN breaker turns callers away. Polling `can_execute` on it lets
    // an expired cool-down move it to HALF_OPEN, so the next caller is the trial.
    fn admits(breaker: &CircuitBreaker) -> bool {
        if breaker.state() != CircuitState::Open {
            return true;
        }
        if breaker.can_execute() {
            debug!(circuit = %breaker.name(), "Cool-down elapsed, next call is a trial");
        }
        false
    }

    fn deny<T, E, G>(
        name: &str,
        fallback: Option<G>,
        config: &CircuitBreakerConfig,
    ) -> Result<Guarded<T>, CircuitBreakerError<E>>
    where
        G: FnOnce() -> T,
    {
        match fallback {
            Some(fallback) if config.enable_fallback => {
                debug!(circuit = %name, "Circuit open, serving fallback");
                Ok(Guarded {
                    value: fallback(),
                    from_fallback: true,
                })
            }
            _ => Err(CircuitBreakerError::Open {
                service: name.to_string(),
            }),
        }
    }

    fn observe<T, E>(breaker: &CircuitBreaker, outcome: Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        match outcome {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                breaker.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stats_of(breaker: &CircuitBreaker) -> CircuitBreakerStats {
    let snapshot = breaker.snapshot();
    CircuitBreakerStats {
        state: snapshot.state,
        failure_count: snapshot.failure_count,
        success_count: snapshot.success_count,
        last_failure_time: snapshot.last_failure.map(|t| t.elapsed()),
        last_success_time: snapshot.last_success.map(|t| t.elapsed()),
    }
}
