//! # Dispatcher Configuration
//!
//! Defaults match the documented policy (3 failures, 60 s open circuit,
//! 2 retries at 1 s / 2 s). Values can be layered from an optional file and
//! `DISPATCH__*` environment variables, e.g.
//! `DISPATCH__CIRCUIT_BREAKER__MAX_FAILURES=5` or
//! `DISPATCH__BACKENDS__SECONDARY__MAX_RETRIES=0`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;
use crate::types::{Error, ErrorKind, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DISPATCH";

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed attempts before the circuit opens
    pub max_failures: u32,
    /// How long an open circuit rejects calls, in milliseconds
    pub circuit_breaker_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            circuit_breaker_timeout_ms: 60_000,
        }
    }
}

/// Retry schedule for a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first invocation
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Per-backend overrides; unset fields inherit the dispatcher defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOverrides {
    pub max_failures: Option<u32>,
    pub circuit_breaker_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

/// Metrics export settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9464`
    pub prometheus_listen: Option<String>,
}

/// Top-level dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Bound on each callable invocation, in milliseconds
    pub call_timeout_ms: u64,
    /// Overrides keyed by backend id
    pub backends: HashMap<String, BackendOverrides>,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            call_timeout_ms: 10_000,
            backends: HashMap::new(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Loads defaults, then the optional file, then `DISPATCH__*` variables.
    ///
    /// A `.env` file in the working directory is read first when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: DispatcherConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                Error::new(
                    ErrorKind::Configuration,
                    format!("Failed to load dispatcher configuration: {}", e),
                )
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the policy meaningless
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::new(ErrorKind::Configuration, msg));

        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be greater than zero".to_string());
        }

        let mut scopes = vec![("default".to_string(), self.circuit_breaker, self.retry)];
        for id in self.backends.keys() {
            scopes.push((id.clone(), self.breaker_for(id), self.retry_for(id)));
        }

        for (scope, breaker, retry) in scopes {
            if breaker.max_failures == 0 {
                return invalid(format!("{}: max_failures must be at least 1", scope));
            }
            if !(retry.backoff_multiplier >= 1.0) {
                return invalid(format!(
                    "{}: backoff_multiplier must be >= 1.0, got {}",
                    scope, retry.backoff_multiplier
                ));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return invalid(format!(
                    "{}: max_delay_ms ({}) is below base_delay_ms ({})",
                    scope, retry.max_delay_ms, retry.base_delay_ms
                ));
            }
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Effective breaker thresholds for a backend
    pub fn breaker_for(&self, backend_id: &str) -> CircuitBreakerConfig {
        let mut effective = self.circuit_breaker;
        if let Some(o) = self.backends.get(backend_id) {
            if let Some(v) = o.max_failures {
                effective.max_failures = v;
            }
            if let Some(v) = o.circuit_breaker_timeout_ms {
                effective.circuit_breaker_timeout_ms = v;
            }
        }
        effective
    }

    /// Effective retry schedule for a backend
    pub fn retry_for(&self, backend_id: &str) -> RetryConfig {
        let mut effective = self.retry;
        if let Some(o) = self.backends.get(backend_id) {
            if let Some(v) = o.max_retries {
                effective.max_retries = v;
            }
            if let Some(v) = o.base_delay_ms {
                effective.base_delay_ms = v;
            }
            if let Some(v) = o.backoff_multiplier {
                effective.backoff_multiplier = v;
            }
            if let Some(v) = o.max_delay_ms {
                effective.max_delay_ms = v;
            }
        }
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_policy() {
        let config = DispatcherConfig::default();
        assert_eq!(config.circuit_breaker.max_failures, 3);
        assert_eq!(config.circuit_breaker.open_duration(), Duration::from_secs(60));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_overrides_inherit_defaults() {
        let mut config = DispatcherConfig::default();
        config.backends.insert(
            "mock".to_string(),
            BackendOverrides {
                max_retries: Some(0),
                max_failures: Some(10),
                ..Default::default()
            },
        );

        let retry = config.retry_for("mock");
        assert_eq!(retry.max_retries, 0);
        assert_eq!(retry.base_delay_ms, 1_000);

        let breaker = config.breaker_for("mock");
        assert_eq!(breaker.max_failures, 10);
        assert_eq!(breaker.circuit_breaker_timeout_ms, 60_000);

        // Unknown backends use the defaults unchanged
        assert_eq!(config.breaker_for("primary"), config.circuit_breaker);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DispatcherConfig::default();
        config.circuit_breaker.max_failures = 0;
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::Configuration);

        let mut config = DispatcherConfig::default();
        config.backends.insert(
            "secondary".to_string(),
            BackendOverrides {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.message.contains("secondary"));

        let mut config = DispatcherConfig::default();
        config.call_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("dispatch-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dispatch.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
call_timeout_ms = 2500

[circuit_breaker]
max_failures = 5

[retry]
base_delay_ms = 200

[backends.mock]
max_retries = 0
"#
        )
        .unwrap();

        let config = DispatcherConfig::load(Some(&path)).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(2500));
        assert_eq!(config.circuit_breaker.max_failures, 5);
        assert_eq!(config.circuit_breaker.circuit_breaker_timeout_ms, 60_000);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry_for("mock").max_retries, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_a_configuration_error() {
        let path = std::env::temp_dir().join("definitely-missing-dispatch-config.toml");
        let err = DispatcherConfig::load(Some(&path)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
