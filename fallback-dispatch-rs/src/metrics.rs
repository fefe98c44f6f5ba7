//! # Metrics
//!
//! Names of everything the dispatcher records through the `metrics` facade,
//! and helpers to install a Prometheus recorder. Nothing is exported unless
//! a recorder is installed; the macros are no-ops otherwise.
//!
//! **Counters:**
//! - `dispatch_requests_total{operation, outcome}`
//! - `dispatch_attempts_total{backend, outcome}`
//! - `dispatch_degraded_total{operation, backend}`
//! - `dispatch_retries_total{backend}`
//! - `circuit_breaker_skips_total{backend}`
//! - `circuit_breaker_transitions_total{backend, to}`
//!
//! **Histograms:**
//! - `dispatch_duration_ms{operation}`
//!
//! **Gauges:**
//! - `circuit_breaker_open{backend}`
//! - `circuit_breaker_consecutive_failures{backend}`

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::config::MetricsConfig;
use crate::types::{Error, ErrorKind, Result};

pub const DISPATCH_REQUESTS_TOTAL: &str = "dispatch_requests_total";
pub const DISPATCH_ATTEMPTS_TOTAL: &str = "dispatch_attempts_total";
pub const DISPATCH_DEGRADED_TOTAL: &str = "dispatch_degraded_total";
pub const DISPATCH_RETRIES_TOTAL: &str = "dispatch_retries_total";
pub const DISPATCH_DURATION_MS: &str = "dispatch_duration_ms";
pub const CIRCUIT_SKIPS_TOTAL: &str = "circuit_breaker_skips_total";
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "circuit_breaker_transitions_total";
pub const CIRCUIT_OPEN: &str = "circuit_breaker_open";
pub const CIRCUIT_CONSECUTIVE_FAILURES: &str = "circuit_breaker_consecutive_failures";

/// Buckets for dispatch latency, in milliseconds. Retries with the default
/// backoff push a fully failing chain well past 10 s.
const DURATION_BUCKETS_MS: &[f64] = &[
    5.0, 25.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(DISPATCH_DURATION_MS.to_string()),
            DURATION_BUCKETS_MS,
        )
        .map_err(|e| exporter_error("invalid histogram buckets", e))
}

fn exporter_error(what: &str, err: impl std::fmt::Display) -> Error {
    Error::new(
        ErrorKind::Configuration,
        format!("Failed to set up metrics exporter, {}: {}", what, err),
    )
}

/// Registers descriptions for every dispatcher metric
pub fn describe_metrics() {
    describe_counter!(DISPATCH_REQUESTS_TOTAL, "Dispatches by final outcome");
    describe_counter!(DISPATCH_ATTEMPTS_TOTAL, "Backend attempts by outcome");
    describe_counter!(
        DISPATCH_DEGRADED_TOTAL,
        "Dispatches answered by a backend other than the primary"
    );
    describe_counter!(DISPATCH_RETRIES_TOTAL, "Retries after a retryable backend error");
    describe_histogram!(DISPATCH_DURATION_MS, Unit::Milliseconds, "End-to-end dispatch latency");
    describe_counter!(CIRCUIT_SKIPS_TOTAL, "Calls skipped because a circuit was open");
    describe_counter!(CIRCUIT_TRANSITIONS_TOTAL, "Circuit state transitions");
    describe_gauge!(CIRCUIT_OPEN, "1 while a backend's circuit is open");
    describe_gauge!(
        CIRCUIT_CONSECUTIVE_FAILURES,
        "Consecutive failed attempts per backend"
    );
}

/// Installs the global recorder with an HTTP scrape endpoint on `listen`.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| exporter_error(&format!("invalid listen address '{}'", listen), e))?;

    builder()?
        .with_http_listener(addr)
        .install()
        .map_err(|e| exporter_error("install failed", e))?;

    describe_metrics();
    info!(listen = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Installs the global recorder without a listener; render through the handle
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = builder()?
        .install_recorder()
        .map_err(|e| exporter_error("install failed", e))?;

    describe_metrics();
    Ok(handle)
}

/// Installs the exporter when `prometheus_listen` is configured
pub fn init_metrics(config: &MetricsConfig) -> Result<bool> {
    match &config.prometheus_listen {
        Some(listen) => install_prometheus_exporter(listen).map(|_| true),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_listen_address() {
        let err = install_prometheus_exporter("not-an-address").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("not-an-address"));
    }

    #[test]
    fn test_no_listener_configured() {
        assert!(!init_metrics(&MetricsConfig::default()).unwrap());
    }
}
