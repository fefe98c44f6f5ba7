//! # Dispatcher
//!
//! Walks an ordered fallback chain of backends for one logical operation.
//! Each backend is consulted through its circuit, run through the retry
//! executor, and the first success wins. When every backend fails the caller
//! gets a single [`DispatchError`] listing what went wrong where.
//!
//! ```ignore
//! let result = dispatcher
//!     .dispatch(
//!         OperationDescriptor::new("searchJobs")
//!             .attempt("primary", move || graphql.query(SEARCH, vars.clone()))
//!             .attempt("secondary", move || rest.get("/api/jobs"))
//!             .attempt("mock", StaticBackend::new(json!([])).callable()),
//!     )
//!     .await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::DispatcherConfig;
use crate::health::{BackendHealth, HealthSnapshot};
use crate::logging::{generate_correlation_id, with_correlation_id};
use crate::metrics::{
    DISPATCH_ATTEMPTS_TOTAL, DISPATCH_DEGRADED_TOTAL, DISPATCH_DURATION_MS,
    DISPATCH_REQUESTS_TOTAL,
};
use crate::retry::{AttemptOutcome, RetryExecutor, RetryPolicy};
use crate::sanitization::sanitize_reason;
use crate::types::{AttemptFailure, DispatchError, Error, ErrorKind, Result};

/// Async function that calls one backend
pub type Callable<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Inspects a successful payload; `Some(reason)` turns it into a failure
pub type ResultCheck<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct Attempt<T> {
    backend_id: String,
    callable: Callable<T>,
    retry_policy: Option<RetryPolicy>,
}

/// One logical operation and the backends that can answer it, in order
pub struct OperationDescriptor<T> {
    operation_name: String,
    attempts: Vec<Attempt<T>>,
    retry_policy: Option<RetryPolicy>,
    call_timeout: Option<Duration>,
    result_check: Option<ResultCheck<T>>,
    correlation_id: Option<String>,
}

impl<T: Send + 'static> OperationDescriptor<T> {
    pub fn new<S: Into<String>>(operation_name: S) -> Self {
        Self {
            operation_name: operation_name.into(),
            attempts: Vec::new(),
            retry_policy: None,
            call_timeout: None,
            result_check: None,
            correlation_id: None,
        }
    }

    /// Appends a backend to the chain
    pub fn attempt<S, F, Fut>(self, backend_id: S, f: F) -> Self
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.push(backend_id.into(), Arc::new(move || f().boxed()), None)
    }

    /// Appends a backend with its own retry policy
    pub fn attempt_with_policy<S, F, Fut>(self, backend_id: S, policy: RetryPolicy, f: F) -> Self
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.push(backend_id.into(), Arc::new(move || f().boxed()), Some(policy))
    }

    /// Appends an already boxed callable
    pub fn attempt_callable<S: Into<String>>(self, backend_id: S, callable: Callable<T>) -> Self {
        self.push(backend_id.into(), callable, None)
    }

    fn push(mut self, backend_id: String, callable: Callable<T>, policy: Option<RetryPolicy>) -> Self {
        self.attempts.push(Attempt {
            backend_id,
            callable,
            retry_policy: policy,
        });
        self
    }

    /// Retry policy for every attempt without its own
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Flags successful payloads that actually carry an application error
    pub fn reject_when<F>(mut self, check: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.result_check = Some(Arc::new(check));
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Backend ids in dispatch order
    pub fn backend_ids(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.backend_id.as_str()).collect()
    }
}

/// Which backend answered a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub backend_id: String,
    pub is_degraded: bool,
    /// Backends that failed or were skipped before the answer
    pub failures: Vec<AttemptFailure>,
}

/// Normalized result of a dispatch
#[derive(Debug)]
pub struct DispatchResult<T> {
    pub operation: String,
    pub correlation_id: String,
    /// Present only on success
    pub value: Option<T>,
    pub answered_by: Option<String>,
    /// True when someone other than the first backend answered
    pub is_degraded: bool,
    /// Present only when no backend answered
    pub error: Option<DispatchError>,
    pub failures: Vec<AttemptFailure>,
    pub elapsed: Duration,
}

impl<T> DispatchResult<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Value and answering backend, or the aggregated error
    pub fn into_result(self) -> std::result::Result<(T, Answer), DispatchError> {
        match (self.value, self.answered_by) {
            (Some(value), Some(backend_id)) => Ok((
                value,
                Answer {
                    backend_id,
                    is_degraded: self.is_degraded,
                    failures: self.failures,
                },
            )),
            _ => Err(self.error.unwrap_or(DispatchError::AllBackendsExhausted {
                operation: self.operation,
                failures: self.failures,
            })),
        }
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    breaker: CircuitBreaker,
}

/// Shared entry point for resilient backend calls
///
/// Cloning is cheap; clones share circuits, so one instance per process is
/// usually what callers want.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_name("dispatcher", config)
    }

    /// Creates a dispatcher whose breaker logs under `name`
    pub fn with_name<S: Into<String>>(name: S, config: DispatcherConfig) -> Self {
        let mut breaker = CircuitBreaker::new(name, config.circuit_breaker);
        for backend_id in config.backends.keys() {
            breaker = breaker.with_backend_config(backend_id.clone(), config.breaker_for(backend_id));
        }

        Self {
            inner: Arc::new(DispatcherInner { config, breaker }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Snapshot of every backend this dispatcher has called
    pub fn health(&self) -> HealthSnapshot {
        self.inner.breaker.snapshot()
    }

    pub fn backend_health(&self, backend_id: &str) -> Option<BackendHealth> {
        self.inner.breaker.backend_health(backend_id)
    }

    pub fn reset_backend(&self, backend_id: &str) -> bool {
        self.inner.breaker.reset(backend_id)
    }

    pub fn reset_all(&self) {
        self.inner.breaker.reset_all()
    }

    /// Runs the fallback chain until one backend answers
    pub async fn dispatch<T: Send + 'static>(
        &self,
        descriptor: OperationDescriptor<T>,
    ) -> DispatchResult<T> {
        self.dispatch_with_cancellation(descriptor, CancellationToken::new())
            .await
    }

    /// Like [`Dispatcher::dispatch`], stopping early once `token` is cancelled.
    ///
    /// A cancelled in-flight call is not recorded against its backend.
    pub async fn dispatch_with_cancellation<T: Send + 'static>(
        &self,
        descriptor: OperationDescriptor<T>,
        token: CancellationToken,
    ) -> DispatchResult<T> {
        let correlation_id = descriptor
            .correlation_id
            .clone()
            .unwrap_or_else(generate_correlation_id);

        let span = info_span!(
            "dispatch",
            operation = %descriptor.operation_name,
            correlation_id = %correlation_id
        );

        with_correlation_id(
            correlation_id.clone(),
            self.run(descriptor, token, correlation_id).instrument(span),
        )
        .await
    }

    fn policy_for<T>(&self, attempt: &Attempt<T>, descriptor: &OperationDescriptor<T>) -> RetryPolicy {
        attempt
            .retry_policy
            .clone()
            .or_else(|| descriptor.retry_policy.clone())
            .unwrap_or_else(|| {
                RetryPolicy::new(
                    attempt.backend_id.clone(),
                    Some(self.inner.config.retry_for(&attempt.backend_id)),
                )
            })
    }

    async fn run<T: Send + 'static>(
        &self,
        descriptor: OperationDescriptor<T>,
        token: CancellationToken,
        correlation_id: String,
    ) -> DispatchResult<T> {
        let start = Instant::now();
        let operation = descriptor.operation_name.clone();
        let mut result = DispatchResult {
            operation: operation.clone(),
            correlation_id,
            value: None,
            answered_by: None,
            is_degraded: false,
            error: None,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        };

        let Some(primary) = descriptor.attempts.first().map(|a| a.backend_id.clone()) else {
            warn!(operation = %operation, "Dispatch rejected: no backends given");
            result.error = Some(DispatchError::InvalidDescriptor(format!(
                "operation '{}' has no backends",
                operation
            )));
            return finish(result, "invalid", start);
        };

        let call_timeout = descriptor
            .call_timeout
            .unwrap_or_else(|| self.inner.config.call_timeout());
        let executor = RetryExecutor::new(call_timeout).with_cancellation(token);
        let check = descriptor.result_check.as_ref();

        for attempt in &descriptor.attempts {
            let backend = attempt.backend_id.as_str();

            if executor.is_cancelled() {
                return cancelled(result, start);
            }

            let permit = match self.inner.breaker.try_acquire(backend) {
                Ok(permit) => permit,
                Err(skip) => {
                    info!(
                        operation = %operation,
                        backend = %backend,
                        outcome = "skipped",
                        reason = %skip.message,
                        "Backend skipped, circuit open"
                    );
                    counter!(DISPATCH_ATTEMPTS_TOTAL, 1, "backend" => backend.to_string(), "outcome" => "skipped");
                    result.failures.push(AttemptFailure {
                        backend_id: backend.to_string(),
                        kind: ErrorKind::CircuitOpen,
                        reason: skip.message,
                        invocations: 0,
                        skipped: true,
                    });
                    continue;
                }
            };

            let policy = self.policy_for(attempt, &descriptor);
            debug!(
                operation = %operation,
                backend = %backend,
                trial = %permit.is_trial(),
                policy = %policy,
                "Calling backend"
            );

            let outcome = executor
                .execute(&operation, backend, &policy, || invoke(&attempt.callable, check))
                .await;

            match outcome {
                AttemptOutcome::Success { value, invocations } => {
                    permit.record_success();

                    let is_degraded = backend != primary;
                    info!(
                        operation = %operation,
                        backend = %backend,
                        outcome = "success",
                        invocations = %invocations,
                        degraded = %is_degraded,
                        "Backend answered"
                    );
                    counter!(DISPATCH_ATTEMPTS_TOTAL, 1, "backend" => backend.to_string(), "outcome" => "success");
                    if is_degraded {
                        counter!(DISPATCH_DEGRADED_TOTAL, 1, "operation" => operation.clone(), "backend" => backend.to_string());
                    }

                    result.value = Some(value);
                    result.answered_by = Some(backend.to_string());
                    result.is_degraded = is_degraded;
                    return finish(result, if is_degraded { "degraded" } else { "primary" }, start);
                }
                AttemptOutcome::Failure { error, invocations } => {
                    permit.record_failure(&error);

                    warn!(
                        operation = %operation,
                        backend = %backend,
                        outcome = "failure",
                        invocations = %invocations,
                        error = %error.summary(),
                        "Backend failed, falling through"
                    );
                    counter!(DISPATCH_ATTEMPTS_TOTAL, 1, "backend" => backend.to_string(), "outcome" => "failure");
                    result.failures.push(AttemptFailure {
                        backend_id: backend.to_string(),
                        kind: error.kind,
                        reason: sanitize_reason(&error.summary()),
                        invocations,
                        skipped: false,
                    });
                }
                AttemptOutcome::Cancelled { invocations } => {
                    // Dropping the permit frees a held trial slot
                    drop(permit);
                    debug!(
                        operation = %operation,
                        backend = %backend,
                        outcome = "cancelled",
                        invocations = %invocations,
                        "Attempt cancelled"
                    );
                    counter!(DISPATCH_ATTEMPTS_TOTAL, 1, "backend" => backend.to_string(), "outcome" => "cancelled");
                    return cancelled(result, start);
                }
            }
        }

        result.error = Some(DispatchError::AllBackendsExhausted {
            operation: operation.clone(),
            failures: result.failures.clone(),
        });
        error!(
            operation = %operation,
            backends = %result.failures.len(),
            "All backends exhausted"
        );
        finish(result, "exhausted", start)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

async fn invoke<T>(callable: &Callable<T>, check: Option<&ResultCheck<T>>) -> Result<T> {
    let value = callable().await?;
    if let Some(reason) = check.and_then(|check| check(&value)) {
        return Err(Error::application(reason));
    }
    Ok(value)
}

fn cancelled<T>(mut result: DispatchResult<T>, start: Instant) -> DispatchResult<T> {
    info!(operation = %result.operation, "Dispatch cancelled by caller");
    result.error = Some(DispatchError::Cancelled {
        operation: result.operation.clone(),
        failures: result.failures.clone(),
    });
    finish(result, "cancelled", start)
}

fn finish<T>(mut result: DispatchResult<T>, outcome: &'static str, start: Instant) -> DispatchResult<T> {
    result.elapsed = start.elapsed();
    counter!(DISPATCH_REQUESTS_TOTAL, 1, "operation" => result.operation.clone(), "outcome" => outcome);
    histogram!(
        DISPATCH_DURATION_MS,
        result.elapsed.as_secs_f64() * 1_000.0,
        "operation" => result.operation.clone()
    );
    result
}
