//! # Retry Mechanism
//!
//! Runs a fallible call up to `max_attempts` times with a computed backoff
//! between attempts. Exhaustion is reported as a [`RetryResult`] value rather
//! than an error, so the caller decides whether giving up is fatal.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{error_chain, DynError, RetryError};
use crate::logging::current_correlation_id;

/// Decides whether a failed attempt should be retried
pub type RetryPredicate = Arc<dyn Fn(DynError<'_>) -> bool + Send + Sync>;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always `initial_delay`
    FixedDelay,
    /// `initial_delay * attempt`
    LinearBackoff,
    /// `initial_delay * backoff_multiplier^(attempt - 1)`
    #[default]
    ExponentialBackoff,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::FixedDelay => write!(f, "FIXED_DELAY"),
            RetryStrategy::LinearBackoff => write!(f, "LINEAR_BACKOFF"),
            RetryStrategy::ExponentialBackoff => write!(f, "EXPONENTIAL_BACKOFF"),
        }
    }
}

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub backoff_multiplier: f64,
    pub strategy: RetryStrategy,
    /// Per-attempt time limit
    pub timeout: Duration,
    /// Retry predicate; retries everything by default
    pub should_retry: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            strategy: RetryStrategy::ExponentialBackoff,
            timeout: Duration::from_millis(10_000),
            should_retry: Arc::new(|_: DynError<'_>| true),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("strategy", &self.strategy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Two quick attempts for latency-sensitive calls
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            timeout: Duration::from_millis(1000),
            ..Self::default()
        }
    }

    /// Five patient attempts for calls that must eventually land
    pub fn robust() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            timeout: Duration::from_millis(30_000),
            ..Self::default()
        }
    }

    /// Replaces the retry predicate
    pub fn with_should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(DynError<'_>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }
}

/// Outcome of a retried call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error_message: Option<String>,
    /// Attempts actually made
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryResult<T> {
    fn succeeded(value: T, attempts: u32, total_duration: Duration) -> Self {
        Self {
            success: true,
            value: Some(value),
            error_message: None,
            attempts,
            total_duration,
        }
    }

    fn failed(message: String, attempts: u32, total_duration: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error_message: Some(message),
            attempts,
            total_duration,
        }
    }

    /// Returns true if an attempt succeeded
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Converts the result to a standard Result
    pub fn into_result(self) -> Result<T, RetryError> {
        match self.value {
            Some(value) if self.success => Ok(value),
            _ => Err(RetryError::Exhausted {
                attempts: self.attempts,
                message: self.error_message.unwrap_or_default(),
            }),
        }
    }
}

/// Delay to wait after `attempt` (1-based) has failed, clamped to `max_delay`
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let attempt = attempt.max(1);

    let delay = match config.strategy {
        RetryStrategy::FixedDelay => config.initial_delay,
        RetryStrategy::LinearBackoff => config
            .initial_delay
            .checked_mul(attempt)
            .unwrap_or(config.max_delay),
        RetryStrategy::ExponentialBackoff => {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            let nanos = config.initial_delay.as_nanos() as f64 * config.backoff_multiplier.powi(exponent);

            if !nanos.is_finite() || nanos >= config.max_delay.as_nanos() as f64 {
                config.max_delay
            } else {
                Duration::from_nanos(nanos.max(0.0).round() as u64)
            }
        }
    };

    delay.min(config.max_delay)
}

/// Stateless retry executor
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryManager;

impl RetryManager {
    pub fn new() -> Self {
        Self
    }

    /// Runs `operation` until it succeeds, is not retryable, or attempts run out
    ///
    /// Blocks the calling thread between attempts. A slow attempt is not
    /// interrupted; it counts as failed once it returns past `config.timeout`.
    pub fn execute<T, E, F>(&self, mut operation: F, config: &RetryConfig) -> RetryResult<T>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let started = Instant::now();
        let max_attempts = config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let attempt_started = Instant::now();
            let outcome = operation();
            let elapsed = attempt_started.elapsed();

            let (message, retryable) = match outcome {
                Ok(value) if elapsed <= config.timeout => {
                    if attempt > 1 {
                        info!(attempts = %attempt, "Operation succeeded after retry");
                    }
                    return RetryResult::succeeded(value, attempt, started.elapsed());
                }
                Ok(_) => judge(
                    &RetryError::AttemptTimedOut {
                        elapsed,
                        limit: config.timeout,
                    },
                    attempt < max_attempts,
                    config,
                ),
                Err(e) => judge(&e, attempt < max_attempts, config),
            };

            if !retryable {
                return give_up(message, attempt, max_attempts, started.elapsed());
            }

            let delay = calculate_delay(attempt, config);
            debug!(
                attempt = %attempt,
                max_attempts = %max_attempts,
                delay_ms = %delay.as_millis(),
                error = %message,
                "Operation failed, retrying"
            );
            std::thread::sleep(delay);
        }

        // The final attempt always returns above.
        RetryResult::failed("no attempts made".to_string(), 0, started.elapsed())
    }

    /// Runs the blocking executor on tokio's blocking pool
    pub async fn execute_async<T, E, F>(&self, operation: F, config: RetryConfig) -> RetryResult<T>
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + 'static,
    {
        let started = Instant::now();
        let manager = *self;

        match tokio::task::spawn_blocking(move || manager.execute(operation, &config)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Retry worker failed");
                RetryResult::failed(format!("retry worker failed: {}", e), 0, started.elapsed())
            }
        }
    }

    /// Async-native form of [`execute`](Self::execute)
    ///
    /// `factory` builds a fresh future per attempt. Unlike the blocking form,
    /// an attempt running past `config.timeout` is cancelled.
    pub async fn execute_future<T, E, F, Fut>(&self, mut factory: F, config: &RetryConfig) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let started = tokio::time::Instant::now();
        let max_attempts = config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let (message, retryable) = match tokio::time::timeout(config.timeout, factory()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        info!(attempts = %attempt, "Operation succeeded after retry");
                    }
                    return RetryResult::succeeded(value, attempt, started.elapsed());
                }
                Ok(Err(e)) => judge(&e, attempt < max_attempts, config),
                Err(_) => judge(
                    &RetryError::AttemptTimedOut {
                        elapsed: config.timeout,
                        limit: config.timeout,
                    },
                    attempt < max_attempts,
                    config,
                ),
            };

            if !retryable {
                return give_up(message, attempt, max_attempts, started.elapsed());
            }

            let delay = calculate_delay(attempt, config);
            debug!(
                attempt = %attempt,
                max_attempts = %max_attempts,
                delay_ms = %delay.as_millis(),
                error = %message,
                "Operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        RetryResult::failed("no attempts made".to_string(), 0, started.elapsed())
    }
}

// The predicate is only consulted when attempts remain.
fn judge(error: DynError<'_>, attempts_remain: bool, config: &RetryConfig) -> (String, bool) {
    (error_chain(error), attempts_remain && (config.should_retry)(error))
}

fn give_up<T>(message: String, attempt: u32, max_attempts: u32, elapsed: Duration) -> RetryResult<T> {
    warn!(
        attempts = %attempt,
        max_attempts = %max_attempts,
        error = %message,
        correlation_id = ?current_correlation_id(),
        "Giving up on operation"
    );
    RetryResult::failed(message, attempt, elapsed)
}
