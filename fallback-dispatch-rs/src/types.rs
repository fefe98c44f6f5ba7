//! # Error Types
//!
//! Structured errors produced by backend callables, plus the aggregate
//! [`DispatchError`] that is the only error a dispatcher caller has to handle.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorizes backend and dispatcher failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure and other network errors
    Communication,
    /// The call did not complete within its time bound
    Timeout,
    /// The backend throttled the request (429)
    RateLimit,
    /// The backend answered with a server-side failure (5xx)
    External,
    /// The request was rejected as invalid (4xx)
    Validation,
    /// The caller is not authenticated or not allowed (401/403)
    Authentication,
    /// The requested entity does not exist (404)
    NotFound,
    /// The backend answered, but the payload carries an application error
    Application,
    /// The backend was skipped because its circuit is open
    CircuitOpen,
    /// The caller cancelled the operation
    Cancelled,
    /// Invalid dispatcher configuration
    Configuration,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Maps an HTTP status code onto an error kind
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimit,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            400..=499 => ErrorKind::Validation,
            500..=599 => ErrorKind::External,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Communication => write!(f, "Communication Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::RateLimit => write!(f, "Rate Limit Error"),
            ErrorKind::External => write!(f, "External Service Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Authentication => write!(f, "Authentication Error"),
            ErrorKind::NotFound => write!(f, "Not Found Error"),
            ErrorKind::Application => write!(f, "Application Error"),
            ErrorKind::CircuitOpen => write!(f, "Circuit Open"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Error returned by a backend callable
///
/// `Clone` drops the opaque `cause`, which is only meaningful where the
/// error was created.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// HTTP-equivalent status code, when the backend reported one
    pub status: Option<u16>,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Correlation ID of the dispatch that produced the error
    pub correlation_id: Option<String>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Explicitly marked as worth retrying, regardless of kind
    pub transient: bool,
    /// Chain of causes (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            status: self.status,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id.clone(),
            context: self.context.clone(),
            transient: self.transient,
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            status: None,
            timestamp: Utc::now(),
            correlation_id: crate::logging::current_correlation_id(),
            context: serde_json::Map::new(),
            transient: false,
            cause: None,
        }
    }

    /// Network-level failure
    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Communication, message)
    }

    /// Time bound exceeded
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Invalid request; never retried by the default predicate
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Application-level error carried inside a successful response
    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    /// Builds an error from an HTTP status code
    pub fn from_status<S: Into<String>>(status: u16, message: S) -> Self {
        Self::new(ErrorKind::from_status(status), message).status(status)
    }

    /// Sets the status code
    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Kind, message and status without the correlation id
    pub fn summary(&self) -> String {
        match self.status {
            Some(status) => format!("{}: {} (Status: {})", self.kind, self.message, status),
            None => format!("{}: {}", self.kind, self.message),
        }
    }

    /// Default retry classification: network errors, timeouts (including 408), 5xx and 429.
    pub fn is_retryable(&self) -> bool {
        if self.transient {
            return true;
        }
        if let Some(status) = self.status {
            return matches!(status, 408 | 429) || (500..=599).contains(&status);
        }
        matches!(
            self.kind,
            ErrorKind::Communication | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::External
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if let Some(status) = self.status {
            write!(f, " (Status: {})", status)?;
        }

        if let Some(correlation_id) = &self.correlation_id {
            write!(f, " [CorrelationID: {}]", correlation_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => ErrorKind::Communication,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string()).cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());

        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorKind::Communication
        } else if let Some(status) = status {
            ErrorKind::from_status(status)
        } else if err.is_decode() {
            ErrorKind::Application
        } else {
            ErrorKind::External
        };

        let mut error = Self::new(kind, format!("HTTP request error: {}", err));
        error.status = status;
        error.cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Application, format!("JSON error: {}", err)).cause(err)
    }
}

/// Why one backend in the chain did not answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Backend identifier as given in the descriptor
    pub backend_id: String,
    /// Kind of the final error for this backend
    pub kind: ErrorKind,
    /// Sanitized failure reason
    pub reason: String,
    /// How many times the callable was invoked (0 when skipped)
    pub invocations: u32,
    /// True when the backend was skipped because its circuit was open
    pub skipped: bool,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            write!(f, "{}: skipped ({})", self.backend_id, self.reason)
        } else {
            write!(
                f,
                "{}: {} after {} call(s)",
                self.backend_id, self.reason, self.invocations
            )
        }
    }
}

fn join_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Terminal outcome of a dispatch that produced no value
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Every attempt failed or was skipped because its circuit was open
    #[error("all backends exhausted for '{operation}': {}", join_failures(.failures))]
    AllBackendsExhausted {
        operation: String,
        failures: Vec<AttemptFailure>,
    },

    /// The caller cancelled the operation before any backend answered
    #[error("operation '{operation}' was cancelled")]
    Cancelled {
        operation: String,
        failures: Vec<AttemptFailure>,
    },

    /// The descriptor cannot be dispatched
    #[error("invalid operation descriptor: {0}")]
    InvalidDescriptor(String),
}

impl DispatchError {
    /// Per-backend failure reasons collected before the dispatch ended
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            DispatchError::AllBackendsExhausted { failures, .. }
            | DispatchError::Cancelled { failures, .. } => failures,
            DispatchError::InvalidDescriptor(_) => &[],
        }
    }

    /// Text suitable for a degraded-state banner; never contains backend detail
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::AllBackendsExhausted { .. } => {
                "This service is temporarily unavailable. Please try again shortly.".to_string()
            }
            DispatchError::Cancelled { .. } => "The request was cancelled.".to_string(),
            DispatchError::InvalidDescriptor(_) => {
                "The request could not be processed.".to_string()
            }
        }
    }
}
