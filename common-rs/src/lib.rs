//! # Common Dispatch Core
//!
//! Shared infrastructure for the chat gateway and its backend services. Every
//! inter-service call goes through the same four steps:
//!
//! - **Discover**: [`ServiceDiscovery`] picks a healthy instance of a logical
//!   service with a per-service load-balancing strategy
//! - **Guard**: [`CircuitBreakerManager`] fast-fails calls to services that keep
//!   failing, optionally serving a fallback
//! - **Call** and **Retry**: [`RetryManager`] re-runs transient failures with
//!   fixed, linear or exponential backoff
//!
//! [`Dispatcher`] composes the three for callers that want all of it at once.
//!

pub mod circuit_breaker;
pub mod circuit_breaker_manager;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod settings;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use circuit_breaker_manager::{CircuitBreakerManager, CircuitBreakerStats, Guarded};
pub use discovery::{
    ConnectionGuard, DiscoveryConfig, LoadBalanceStrategy, ServiceDiscovery, ServiceInstance, ServiceStats,
};
pub use dispatch::Dispatcher;
pub use error::{CircuitBreakerError, ConfigError, DispatchError, Error, RegistryError, Result, RetryError};
pub use logging::{current_correlation_id, init_logging, set_correlation_id, LoggingConfig};
pub use registry::{InMemoryRegistry, ServiceRegistry, UnavailableRegistry};
pub use retry::{calculate_delay, RetryConfig, RetryManager, RetryResult, RetryStrategy};
pub use settings::Settings;

/// Loads settings from `path` and the environment, then installs logging
pub fn init(path: Option<&str>) -> Result<Settings> {
    let settings = Settings::load(path)?;
    init_logging(Some(settings.logging.clone()))?;
    Ok(settings)
}
