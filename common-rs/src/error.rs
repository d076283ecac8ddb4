//! # Error Types
//!
//! Error types shared by the dispatch core. Each failure domain has its own
//! enum so callers can match on exactly the conditions a component can produce.

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-level failures raised while bootstrapping the core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The logging subsystem could not be installed
    #[error("Logging initialization failed: {0}")]
    Logging(String),

    /// The external service registry reported an error
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Invalid endpoint '{endpoint}' for service {service}")]
    InvalidEndpoint { service: String, endpoint: String },
}

/// Errors reported by the external service registry collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Service registry is unavailable")]
    Unavailable,

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Registry request failed: {0}")]
    Request(String),
}

/// Outcome of a call guarded by a circuit breaker
///
/// `Open` is the admission denial; `Inner` carries the primary call's own
/// error untouched.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker for `service` rejected the call and no fallback was used
    #[error("Circuit breaker is OPEN for service: {service}")]
    Open { service: String },

    /// The primary call ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns true if the call was rejected without running
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// Returns the primary call's error, if the call ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(err) => Some(err),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Failures surfaced by the retry executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// An attempt returned, but only after the configured timeout
    #[error("Function execution timed out after {}ms (limit {}ms)", .elapsed.as_millis(), .limit.as_millis())]
    AttemptTimedOut { elapsed: Duration, limit: Duration },

    /// Every permitted attempt failed, or a failure was not retryable
    #[error("Operation failed after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },
}

/// Failures surfaced by the composed dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Discovery returned no healthy instance and no fallback endpoint exists
    #[error("No healthy instance available for service: {service}")]
    NoHealthyInstance { service: String },

    /// The breaker for the service rejected the call
    #[error("Circuit breaker is OPEN for service: {service}")]
    CircuitOpen { service: String },

    /// The call kept failing until the retry budget ran out
    #[error("Call to {service} at {endpoint} failed")]
    Exhausted {
        service: String,
        endpoint: String,
        #[source]
        source: RetryError,
    },
}

impl DispatchError {
    /// Returns the logical service name this error refers to
    pub fn service(&self) -> &str {
        match self {
            DispatchError::NoHealthyInstance { service }
            | DispatchError::CircuitOpen { service }
            | DispatchError::Exhausted { service, .. } => service,
        }
    }
}

/// A borrowed view of any error, as handed to retry predicates
pub type DynError<'a> = &'a (dyn StdError + 'static);

/// Renders an error together with its source chain on one line
pub fn error_chain(err: DynError<'_>) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_display() {
        let err: CircuitBreakerError<std::io::Error> = CircuitBreakerError::Open {
            service: "user-service".to_string(),
        };

        assert!(err.is_open());
        assert_eq!(err.to_string(), "Circuit breaker is OPEN for service: user-service");
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn test_inner_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = CircuitBreakerError::Inner(io);

        assert!(!err.is_open());
        assert_eq!(err.to_string(), "connection refused");
        assert_eq!(err.into_inner().map(|e| e.kind()), Some(std::io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_error_chain() {
        let err = DispatchError::Exhausted {
            service: "message-service".to_string(),
            endpoint: "10.0.0.7:50053".to_string(),
            source: RetryError::Exhausted {
                attempts: 3,
                message: "unavailable".to_string(),
            },
        };

        let rendered = error_chain(&err);
        assert_eq!(
            rendered,
            "Call to message-service at 10.0.0.7:50053 failed: Operation failed after 3 attempt(s): unavailable"
        );
        assert_eq!(err.service(), "message-service");
    }

    #[test]
    fn test_timeout_display() {
        let err = RetryError::AttemptTimedOut {
            elapsed: Duration::from_millis(1500),
            limit: Duration::from_millis(1000),
        };

        assert_eq!(err.to_string(), "Function execution timed out after 1500ms (limit 1000ms)");
    }
}
