//! # Fallback Dispatch
//!
//! Resilient calls to an ordered chain of backends for the caller-side
//! services (users, jobs, resumes, skills, company research):
//!
//! - Per-backend circuit breaker shared by every caller of a [`Dispatcher`]
//! - Retry with exponential backoff for transient failures
//! - Ordered fallback from primary to secondary to static data
//! - Read-only health snapshots for dashboards
//! - Structured logging with correlation IDs and Prometheus metrics
//!

pub mod backends;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod sanitization;
pub mod types;

// Re-export commonly used types
pub use backends::{GraphqlBackend, RestBackend, StaticBackend};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use config::{BackendOverrides, CircuitBreakerConfig, DispatcherConfig, RetryConfig};
pub use dispatcher::{Answer, DispatchResult, Dispatcher, OperationDescriptor};
pub use health::{BackendHealth, HealthSnapshot};
pub use logging::{current_correlation_id, init_logging, with_correlation_id, LoggingConfig};
pub use retry::{AttemptOutcome, RetryExecutor, RetryPolicy};
pub use sanitization::sanitize_reason;
pub use types::{AttemptFailure, DispatchError, Error, ErrorKind, Result};
pub use tokio_util::sync::CancellationToken;

