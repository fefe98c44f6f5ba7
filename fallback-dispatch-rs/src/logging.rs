//! # Structured Logging
//!
//! Subscriber setup and correlation ID tracking. Correlation IDs are scoped to
//! the async task that runs a dispatch, so every event emitted while a
//! dispatch is in flight can be tied back to the request that caused it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use uuid::Uuid;

use crate::types::{Error, ErrorKind, Result};

tokio::task_local! {
    static CORRELATION_ID: String;
}

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name, used as the log file prefix
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Directory for daily rolling log files; stdout only when unset
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "fallback-dispatch".to_string(),
            json_format: true,
            log_dir: None,
        }
    }
}

/// Keeps the background file writer alive; drop it on shutdown to flush.
#[must_use = "dropping the guard stops the file log writer"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes the structured logging system
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<LoggingGuard> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(LoggingGuard { _file_guard: None });
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            Error::new(
                ErrorKind::Configuration,
                format!("Invalid log level '{}': {}", config.level, e),
            )
        })?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true));

    let (file_layer, file_guard) = match &config.log_dir {
        Some(log_dir) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
            Error::new(
                ErrorKind::Configuration,
                format!("Failed to set global subscriber: {}", e),
            )
        })?;

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Generates a fresh correlation ID
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Retrieves the correlation ID of the current task, if any
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Runs a future with the given correlation ID in scope
pub async fn with_correlation_id<F, S>(correlation_id: S, future: F) -> F::Output
where
    F: Future,
    S: Into<String>,
{
    CORRELATION_ID.scope(correlation_id.into(), future).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_correlation_id_scope() {
        assert!(current_correlation_id().is_none());

        let seen = with_correlation_id("req-42", async { current_correlation_id() }).await;
        assert_eq!(seen.as_deref(), Some("req-42"));

        assert!(current_correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_nested_correlation_id() {
        let (outer, inner) = with_correlation_id("outer-id", async {
            let inner = with_correlation_id("inner-id", async { current_correlation_id() }).await;
            (current_correlation_id(), inner)
        })
        .await;

        assert_eq!(outer.as_deref(), Some("outer-id"));
        assert_eq!(inner.as_deref(), Some("inner-id"));
    }

    #[tokio::test]
    async fn test_errors_pick_up_correlation_id() {
        let err = with_correlation_id("req-7", async { Error::timeout("slow") }).await;
        assert_eq!(err.correlation_id.as_deref(), Some("req-7"));
    }

    #[test]
    fn test_generate_correlation_id() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
