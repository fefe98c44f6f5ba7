//! # Retry Mechanism
//!
//! Runs one backend attempt: invoke the callable, and on a retryable failure
//! sleep `base_delay * multiplier^n` before trying again, until the retry
//! budget is spent. Each invocation is bounded by a call timeout and every
//! wait observes the caller's cancellation token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::metrics::DISPATCH_RETRIES_TOTAL;
use crate::types::{Error, Result};

/// Decides whether an error is worth another invocation
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Result of one attempt against one backend, retries included
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The callable produced a value
    Success { value: T, invocations: u32 },
    /// Retries exhausted or the error was not retryable
    Failure { error: Error, invocations: u32 },
    /// The caller gave up; nothing should be recorded
    Cancelled { invocations: u32 },
}

impl<T> AttemptOutcome<T> {
    pub fn invocations(&self) -> u32 {
        match self {
            AttemptOutcome::Success { invocations, .. }
            | AttemptOutcome::Failure { invocations, .. }
            | AttemptOutcome::Cancelled { invocations } => *invocations,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }

    /// Converts the outcome to a standard Result
    pub fn into_result(self) -> Result<T> {
        match self {
            AttemptOutcome::Success { value, .. } => Ok(value),
            AttemptOutcome::Failure { error, .. } => Err(error),
            AttemptOutcome::Cancelled { .. } => Err(Error::new(
                crate::types::ErrorKind::Cancelled,
                "attempt cancelled by caller",
            )),
        }
    }
}

/// A retry policy that determines how to handle retries
#[derive(Clone)]
pub struct RetryPolicy {
    /// Name of the policy (for logging)
    name: String,
    config: RetryConfig,
    predicate: RetryPredicate,
}

impl RetryPolicy {
    /// Creates a new retry policy; `None` uses the default schedule
    pub fn new<S: Into<String>>(name: S, config: Option<RetryConfig>) -> Self {
        Self {
            name: name.into(),
            config: config.unwrap_or_default(),
            predicate: Arc::new(Error::is_retryable),
        }
    }

    /// Creates a policy for operations that should never be retried
    pub fn never() -> Self {
        Self::new(
            "never",
            Some(RetryConfig {
                max_retries: 0,
                ..Default::default()
            }),
        )
    }

    /// Creates a simple policy with a fixed number of retries
    pub fn fixed<S: Into<String>>(name: S, retries: u32) -> Self {
        Self::new(
            name,
            Some(RetryConfig {
                max_retries: retries,
                ..Default::default()
            }),
        )
    }

    /// Replaces the default retryable-error predicate
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// True when `error` may be retried after `retries_done` retries
    pub fn is_retryable(&self, error: &Error, retries_done: u32) -> bool {
        retries_done < self.config.max_retries && (self.predicate)(error)
    }

    /// Delay before retry number `retry_index` (0-based), capped at `max_delay_ms`
    pub fn calculate_backoff(&self, retry_index: u32) -> Duration {
        let base_ms = self.config.base_delay_ms as f64;
        let max_ms = self.config.max_delay_ms as f64;

        let exp_backoff = base_ms * self.config.backoff_multiplier.powi(retry_index as i32);
        Duration::from_millis(exp_backoff.min(max_ms).max(0.0) as u64)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy({}, max_retries={})",
            self.name, self.config.max_retries
        )
    }
}

/// Default policy: 2 retries at 1 s and 2 s
impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", None)
    }
}

/// Runs attempts under a call timeout and a cancellation token
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs one attempt against `backend` until it succeeds, fails for good,
    /// or is cancelled.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: &str,
        backend: &str,
        policy: &RetryPolicy,
        f: F,
    ) -> AttemptOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start_time = Instant::now();
        let mut invocations = 0u32;
        let mut retries_done = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return AttemptOutcome::Cancelled { invocations };
            }

            invocations += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(operation = %operation, backend = %backend, "Call cancelled in flight");
                    return AttemptOutcome::Cancelled { invocations };
                }
                result = timeout(self.call_timeout, f()) => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "call to '{}' timed out after {} ms",
                        backend,
                        self.call_timeout.as_millis()
                    ))
                    .context("backend", backend)
                    .context("timeout_ms", self.call_timeout.as_millis() as u64)),
                },
            };

            let error = match result {
                Ok(value) => {
                    if retries_done > 0 {
                        info!(
                            operation = %operation,
                            backend = %backend,
                            invocations = %invocations,
                            duration_ms = %start_time.elapsed().as_millis(),
                            "Call succeeded after retries"
                        );
                    }
                    return AttemptOutcome::Success { value, invocations };
                }
                Err(error) => error,
            };

            if !policy.is_retryable(&error, retries_done) {
                warn!(
                    operation = %operation,
                    backend = %backend,
                    invocations = %invocations,
                    max_retries = %policy.max_retries(),
                    duration_ms = %start_time.elapsed().as_millis(),
                    error = %error,
                    "Giving up on backend"
                );

                let error = error
                    .context("backend", backend)
                    .context("invocations", invocations)
                    .context("duration_ms", start_time.elapsed().as_millis() as u64);
                return AttemptOutcome::Failure { error, invocations };
            }

            let backoff = policy.calculate_backoff(retries_done);
            retries_done += 1;

            debug!(
                operation = %operation,
                backend = %backend,
                retry = %retries_done,
                max_retries = %policy.max_retries(),
                backoff_ms = %backoff.as_millis(),
                error = %error,
                "Retrying after error"
            );
            counter!(DISPATCH_RETRIES_TOTAL, 1, "backend" => backend.to_string());

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(operation = %operation, backend = %backend, "Backoff cancelled");
                    return AttemptOutcome::Cancelled { invocations };
                }
                _ = sleep(backoff) => {}
            }
        }
    }
}
