//! # Layered Settings
//!
//! Built-in defaults, then an optional TOML file, then `CHAT__SECTION__KEY`
//! environment variables. Durations are plain integers in the sources and
//! become `Duration`s in the runtime configs handed to each manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::discovery::{DiscoveryConfig, LoadBalanceStrategy, DEFAULT_SERVICES};
use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::retry::{RetryConfig, RetryStrategy};

const ENV_PREFIX: &str = "CHAT";
const ENV_SEPARATOR: &str = "__";

/// Top-level settings for the dispatch core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub discovery: DiscoverySettings,
    pub server: ServerSettings,
}

/// Where the gateway serves its health and stats endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Breaker defaults and the idle sweep schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub enable_fallback: bool,
    pub cleanup_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 60_000,
            reset_timeout_ms: 30_000,
            enable_fallback: true,
            cleanup_interval_secs: 600,
            idle_timeout_secs: 3600,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_millis(self.timeout_ms),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            enable_fallback: self.enable_fallback,
        }
    }
}

/// Default retry policy for outbound calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub strategy: RetryStrategy,
    pub timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            strategy: RetryStrategy::ExponentialBackoff,
            timeout_ms: 10_000,
        }
    }
}

impl RetrySettings {
    /// Builds the runtime config; the retry predicate is left at "always retry"
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            strategy: self.strategy,
            timeout: Duration::from_millis(self.timeout_ms),
            ..RetryConfig::default()
        }
    }
}

/// Which services to watch and how to balance across their instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub interval_secs: u64,
    pub default_strategy: LoadBalanceStrategy,
    pub services: Vec<String>,
    pub strategies: HashMap<String, LoadBalanceStrategy>,
    pub fallback_endpoints: HashMap<String, String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            default_strategy: LoadBalanceStrategy::RoundRobin,
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            strategies: HashMap::new(),
            fallback_endpoints: HashMap::new(),
        }
    }
}

impl DiscoverySettings {
    pub fn to_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            interval: Duration::from_secs(self.interval_secs),
            default_strategy: self.default_strategy,
            services: self.services.clone(),
            strategies: self.strategies.clone(),
            fallback_endpoints: self.fallback_endpoints.clone(),
        }
    }
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and the environment
    ///
    /// A missing file is not an error. `.env` is read first so its entries are
    /// visible to the environment source.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder = builder.add_source(environment());

        Self::from_builder(builder)
    }

    /// Deserializes and validates settings from an assembled builder
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        debug!(
            failure_threshold = %settings.circuit_breaker.failure_threshold,
            max_attempts = %settings.retry.max_attempts,
            services = ?settings.discovery.services,
            "Settings loaded"
        );

        Ok(settings)
    }

    /// Checks the invariants the managers rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "server.bind_address '{}' is not a socket address",
                self.server.bind_address
            )));
        }

        for (service, endpoint) in &self.discovery.fallback_endpoints {
            if parse_endpoint(endpoint).is_none() {
                return Err(ConfigError::InvalidEndpoint {
                    service: service.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }

        Ok(())
    }
}

/// `CHAT__SECTION__KEY` variables, e.g. `CHAT__RETRY__MAX_ATTEMPTS=5`
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Splits a `host:port` endpoint, rejecting an empty host or a bad port
pub fn parse_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
        Settings::from_builder(config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_empty_source_yields_defaults() {
        let settings = Settings::from_builder(config::Config::builder()).unwrap();
        assert_eq!(settings, Settings::default());

        let cb = settings.circuit_breaker.to_config();
        assert_eq!(cb, CircuitBreakerConfig::default());
        assert_eq!(settings.circuit_breaker.cleanup_interval(), Duration::from_secs(600));
        assert_eq!(settings.circuit_breaker.idle_timeout(), Duration::from_secs(3600));

        let retry = settings.retry.to_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_millis(5000));
        assert_eq!(retry.strategy, RetryStrategy::ExponentialBackoff);
        assert_eq!(retry.timeout, Duration::from_millis(10_000));

        let discovery = settings.discovery.to_config();
        assert_eq!(discovery.interval, Duration::from_secs(30));
        assert_eq!(discovery.services, vec!["user-service", "social-service", "message-service"]);
    }

    #[test]
    fn test_toml_overrides() {
        let settings = from_toml(
            r#"
            [circuit_breaker]
            failure_threshold = 2
            timeout_ms = 1500

            [retry]
            strategy = "linear_backoff"
            max_attempts = 4

            [discovery]
            default_strategy = "least_conn"
            services = ["user-service"]

            [discovery.strategies]
            user-service = "weighted"

            [discovery.fallback_endpoints]
            user-service = "127.0.0.1:50051"
            "#,
        )
        .unwrap();

        assert_eq!(settings.circuit_breaker.failure_threshold, 2);
        assert_eq!(settings.circuit_breaker.to_config().timeout, Duration::from_millis(1500));
        assert_eq!(settings.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(settings.retry.strategy, RetryStrategy::LinearBackoff);
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.discovery.default_strategy, LoadBalanceStrategy::LeastConn);
        assert_eq!(
            settings.discovery.strategies.get("user-service"),
            Some(&LoadBalanceStrategy::Weighted)
        );
        assert_eq!(settings.discovery.services, vec!["user-service"]);
    }

    #[test]
    fn test_environment_overrides_file() {
        let env = HashMap::from([
            ("CHAT__RETRY__MAX_ATTEMPTS".to_string(), "5".to_string()),
            ("CHAT__CIRCUIT_BREAKER__FAILURE_THRESHOLD".to_string(), "7".to_string()),
            ("UNRELATED__RETRY__MAX_ATTEMPTS".to_string(), "9".to_string()),
        ]);

        let settings = Settings::from_builder(
            config::Config::builder()
                .add_source(File::from_str("[retry]\nmax_attempts = 4\ninitial_delay_ms = 50", FileFormat::Toml))
                .add_source(environment().source(Some(env))),
        )
        .unwrap();

        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay_ms, 50);
        assert_eq!(settings.circuit_breaker.failure_threshold, 7);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = from_toml("[circuit_breaker]\nfailure_threshold = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = from_toml("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = from_toml("[retry]\nbackoff_multiplier = 0.5").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = from_toml("[retry]\ninitial_delay_ms = 6000").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = from_toml("[server]\nbind_address = \"localhost\"").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = from_toml("[discovery.fallback_endpoints]\nuser-service = \"localhost\"").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEndpoint { ref service, .. } if service == "user-service"
        ));
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("10.0.0.5:50051"), Some(("10.0.0.5", 50051)));
        assert_eq!(parse_endpoint("user-service.internal:80"), Some(("user-service.internal", 80)));
        assert_eq!(parse_endpoint(":80"), None);
        assert_eq!(parse_endpoint("host:99999"), None);
        assert_eq!(parse_endpoint("host"), None);
    }
}
