//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber and tracks a per-thread
//! correlation ID so every log line of one outbound call can be tied together.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use uuid::Uuid;

use crate::error::{Error, Result};

thread_local! {
    static CORRELATION_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Flushes the file appender on process exit; must outlive the subscriber.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name written into file names and the startup line
    pub service_name: String,
    /// Whether to use JSON formatting on stdout
    pub json_format: bool,
    /// Whether to also write logs to a daily-rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "chat-gateway".to_string(),
            json_format: false,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Initializes the structured logging system
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Logging(format!("invalid log level '{}': {}", config.level, e)))?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let file_appender = tracing_appender::rolling::daily(
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = FILE_GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Logging(format!("failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Sets the correlation ID for the current thread
pub fn set_correlation_id<S: Into<String>>(correlation_id: S) {
    CORRELATION_ID.with(|id| *id.borrow_mut() = Some(correlation_id.into()));
}

/// Generates and sets a new correlation ID
pub fn generate_correlation_id() -> String {
    let id = Uuid::new_v4().to_string();
    set_correlation_id(id.clone());
    id
}

/// Retrieves the current correlation ID
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.with(|id| id.borrow().clone())
}

/// Clears the correlation ID for the current thread
pub fn clear_correlation_id() {
    CORRELATION_ID.with(|id| *id.borrow_mut() = None);
}

/// Executes a function with a specific correlation ID, restoring the previous one afterwards
pub fn with_correlation_id<F, R, S>(correlation_id: S, f: F) -> R
where
    F: FnOnce() -> R,
    S: Into<String>,
{
    let previous = current_correlation_id();
    set_correlation_id(correlation_id);

    let result = f();

    match previous {
        Some(id) => set_correlation_id(id),
        None => clear_correlation_id(),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id() {
        assert!(current_correlation_id().is_none());

        set_correlation_id("test-correlation-id");
        assert_eq!(current_correlation_id(), Some("test-correlation-id".to_string()));

        clear_correlation_id();
        assert!(current_correlation_id().is_none());
    }

    #[test]
    fn test_with_correlation_id() {
        let result = with_correlation_id("nested-id", || {
            assert_eq!(current_correlation_id(), Some("nested-id".to_string()));
            "test-result"
        });

        assert_eq!(result, "test-result");
        assert!(current_correlation_id().is_none());

        set_correlation_id("outer-id");
        let result = with_correlation_id("inner-id", || {
            assert_eq!(current_correlation_id(), Some("inner-id".to_string()));
            "nested-test"
        });

        assert_eq!(result, "nested-test");
        assert_eq!(current_correlation_id(), Some("outer-id".to_string()));
        clear_correlation_id();
    }

    #[test]
    fn test_generate_correlation_id() {
        let id = generate_correlation_id();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(current_correlation_id(), Some(id));
        clear_correlation_id();
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_json::from_str(r#"{"level": "debug"}"#).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.service_name, "chat-gateway");
        assert!(!config.file_output);
    }
}
