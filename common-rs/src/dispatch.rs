//! Discover, guard, call, retry
//!
//! A [`Dispatcher`] composes the three managers into the single call site used
//! for every outbound service call: pick an instance, check its service's
//! breaker, run the call with retries, and let the breaker observe only the
//! final outcome.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker_manager::CircuitBreakerManager;
use crate::discovery::{ServiceDiscovery, ServiceInstance};
use crate::error::{CircuitBreakerError, DispatchError, RetryError};
use crate::logging::{current_correlation_id, with_correlation_id};
use crate::retry::{RetryConfig, RetryManager};
use crate::settings::parse_endpoint;

/// Shared entry point for resilient outbound calls
#[derive(Debug, Clone)]
pub struct Dispatcher {
    discovery: Arc<ServiceDiscovery>,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryManager,
    breaker_config: CircuitBreakerConfig,
    retry_config: RetryConfig,
}

impl Dispatcher {
    /// Builds a dispatcher using the manager's default breaker config
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        breakers: Arc<CircuitBreakerManager>,
        retry_config: RetryConfig,
    ) -> Self {
        let breaker_config = breakers.default_config().clone();

        Self {
            discovery,
            breakers,
            retry: RetryManager::new(),
            breaker_config,
            retry_config,
        }
    }

    /// Overrides the breaker config used when a service's breaker is first created
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Picks the instance the next call to `service` should go to
    ///
    /// Falls back to the configured fixed endpoint when discovery has no
    /// healthy instance.
    pub fn resolve(&self, service: &str) -> Result<ServiceInstance, DispatchError> {
        if let Some(instance) = self.discovery.next_instance(service) {
            return Ok(instance);
        }

        let endpoint = self.discovery.config().fallback_endpoints.get(service);
        match endpoint.map(|e| (e, parse_endpoint(e))) {
            Some((_, Some((host, port)))) => {
                debug!(service = %service, host = %host, port = %port, "Using fallback endpoint");
                Ok(ServiceInstance::new(format!("{}-fallback", service), service, host, port))
            }
            Some((endpoint, None)) => {
                warn!(service = %service, endpoint = %endpoint, "Ignoring malformed fallback endpoint");
                Err(DispatchError::NoHealthyInstance {
                    service: service.to_string(),
                })
            }
            None => Err(DispatchError::NoHealthyInstance {
                service: service.to_string(),
            }),
        }
    }

    /// Calls `service` through discovery, its breaker and the retry policy
    ///
    /// `operation` receives the chosen instance and may be invoked several
    /// times. Blocks the calling thread while backing off between attempts.
    pub fn call<T, E, F>(&self, service: &str, operation: F) -> Result<T, DispatchError>
    where
        F: FnMut(&ServiceInstance) -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        self.correlated(|| self.dispatch(service, operation, None::<fn() -> T>))
    }

    /// Like [`call`](Self::call), but answers with `fallback` while the breaker is open
    pub fn call_with_fallback<T, E, F, G>(
        &self,
        service: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(&ServiceInstance) -> Result<T, E>,
        E: std::error::Error + 'static,
        G: FnOnce() -> T,
    {
        self.correlated(|| self.dispatch(service, operation, Some(fallback)))
    }

    fn dispatch<T, E, F, G>(
        &self,
        service: &str,
        mut operation: F,
        fallback: Option<G>,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(&ServiceInstance) -> Result<T, E>,
        E: std::error::Error + 'static,
        G: FnOnce() -> T,
    {
        let instance = self.resolve(service)?;
        let endpoint = instance.endpoint();
        let _connection = self.discovery.acquire_connection(&instance);

        debug!(
            service = %service,
            endpoint = %endpoint,
            correlation_id = ?current_correlation_id(),
            "Dispatching call"
        );

        let primary = || {
            self.retry
                .execute(|| operation(&instance), &self.retry_config)
                .into_result()
        };

        let outcome: Result<T, CircuitBreakerError<RetryError>> = match fallback {
            Some(fallback) => self
                .breakers
                .execute(service, primary, fallback, &self.breaker_config),
            None => self
                .breakers
                .execute_guarded(service, primary, &self.breaker_config),
        };

        outcome.map_err(|e| match e {
            CircuitBreakerError::Open { service } => DispatchError::CircuitOpen { service },
            CircuitBreakerError::Inner(source) => DispatchError::Exhausted {
                service: service.to_string(),
                endpoint,
                source,
            },
        })
    }

    // Tags the call with a fresh correlation ID unless the caller already set one.
    fn correlated<R>(&self, f: impl FnOnce() -> R) -> R {
        match current_correlation_id() {
            Some(_) => f(),
            None => with_correlation_id(Uuid::new_v4().to_string(), f),
        }
    }
}
