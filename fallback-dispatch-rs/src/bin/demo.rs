//! Fallback dispatch demo
//!
//! Runs a job search and a user profile lookup through the
//! primary → secondary → mock chain against in-process simulated backends,
//! then prints the health snapshot as JSON.
//!
//! Usage: `fallback-dispatch-demo [config.toml]`

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use fallback_dispatch::metrics::{init_metrics, install_prometheus_recorder};
use fallback_dispatch::{
    DispatchResult, Dispatcher, DispatcherConfig, Error, OperationDescriptor, StaticBackend,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    id: String,
    title: String,
    company: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserProfile {
    id: String,
    name: String,
    email: String,
}

/// Simulated remote service with a switch to take it down
#[derive(Clone)]
struct SimulatedService {
    name: &'static str,
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    latency: Duration,
}

impl SimulatedService {
    fn new(name: &'static str, healthy: bool, latency: Duration) -> Self {
        Self {
            name,
            healthy: Arc::new(AtomicBool::new(healthy)),
            calls: Arc::new(AtomicUsize::new(0)),
            latency,
        }
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn call<T>(&self, answer: impl FnOnce() -> T) -> Result<T, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        if self.healthy.load(Ordering::SeqCst) {
            Ok(answer())
        } else {
            Err(Error::from_status(503, format!("{} is unavailable", self.name)))
        }
    }
}

fn sample_jobs(source: &str) -> Vec<Job> {
    vec![
        Job {
            id: format!("{}-1", source),
            title: "Backend Engineer".to_string(),
            company: "Acme".to_string(),
        },
        Job {
            id: format!("{}-2", source),
            title: "Site Reliability Engineer".to_string(),
            company: "Globex".to_string(),
        },
    ]
}

fn search_jobs(graphql: &SimulatedService, rest: &SimulatedService) -> OperationDescriptor<Vec<Job>> {
    let (graphql, rest) = (graphql.clone(), rest.clone());
    OperationDescriptor::new("searchJobs")
        .attempt("jobs-graphql", move || {
            let graphql = graphql.clone();
            async move { graphql.call(|| sample_jobs("graphql")).await }
        })
        .attempt("jobs-rest", move || {
            let rest = rest.clone();
            async move { rest.call(|| sample_jobs("rest")).await }
        })
        .attempt("jobs-mock", StaticBackend::new(sample_jobs("mock")).callable())
}

fn user_profile(graphql: &SimulatedService, user_id: &str) -> OperationDescriptor<UserProfile> {
    let graphql = graphql.clone();
    let user_id = user_id.to_string();
    let mock = UserProfile {
        id: user_id.clone(),
        name: "Guest".to_string(),
        email: "guest@example.com".to_string(),
    };

    OperationDescriptor::new("getUserProfile")
        .attempt("users-graphql", move || {
            let graphql = graphql.clone();
            let user_id = user_id.clone();
            async move {
                graphql
                    .call(|| UserProfile {
                        id: user_id,
                        name: "Ada Lovelace".to_string(),
                        email: "ada@example.com".to_string(),
                    })
                    .await
            }
        })
        .attempt("users-mock", StaticBackend::new(mock).callable())
}

fn report<T: std::fmt::Debug>(label: &str, result: &DispatchResult<T>) {
    match (&result.value, &result.error) {
        (Some(value), _) => println!(
            "{:<28} answered by {:<14} degraded={:<5} in {:>6} ms: {:?}",
            label,
            result.answered_by.as_deref().unwrap_or("-"),
            result.is_degraded,
            result.elapsed.as_millis(),
            value
        ),
        (None, Some(error)) => println!("{:<28} failed: {} ({})", label, error.user_message(), error),
        (None, None) => println!("{:<28} no result", label),
    }
    for failure in &result.failures {
        println!("{:<28}   - {}", "", failure);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = DispatcherConfig::load(config_path.as_deref())
        .context("loading dispatcher configuration")?;

    // Keep the demo short unless a config file says otherwise
    if config_path.is_none() {
        config.retry.base_delay_ms = 100;
        config.circuit_breaker.circuit_breaker_timeout_ms = 2_000;
        config.logging.json_format = false;
    }

    let _log_guard = fallback_dispatch::init_logging(Some(config.logging.clone()))
        .context("initializing logging")?;
    let metrics_handle = if init_metrics(&config.metrics)? {
        None
    } else {
        Some(install_prometheus_recorder()?)
    };

    let dispatcher = Dispatcher::with_name("demo", config);
    let jobs_graphql = SimulatedService::new("jobs-graphql", false, Duration::from_millis(20));
    let jobs_rest = SimulatedService::new("jobs-rest", true, Duration::from_millis(40));
    let users_graphql = SimulatedService::new("users-graphql", true, Duration::from_millis(15));

    println!("Fallback dispatch demo");
    println!("======================\n");

    println!("Primary job search API is down; REST answers instead.\n");
    for round in 1..=3 {
        let result = dispatcher.dispatch(search_jobs(&jobs_graphql, &jobs_rest)).await;
        report(&format!("searchJobs #{}", round), &result);
    }

    let result = dispatcher.dispatch(user_profile(&users_graphql, "u-42")).await;
    report("getUserProfile", &result);

    println!("\nCircuit for jobs-graphql is open; the next call skips it.\n");
    let before = jobs_graphql.calls();
    let result = dispatcher.dispatch(search_jobs(&jobs_graphql, &jobs_rest)).await;
    report("searchJobs (circuit open)", &result);
    info!(
        calls_before = before,
        calls_after = jobs_graphql.calls(),
        "Primary was not invoked while open"
    );

    println!("\nREST goes down too; static data keeps the page alive.\n");
    jobs_rest.set_healthy(false);
    let result = dispatcher.dispatch(search_jobs(&jobs_graphql, &jobs_rest)).await;
    report("searchJobs (degraded)", &result);

    let wait = dispatcher
        .backend_health("jobs-graphql")
        .map(|h| h.time_until_retry())
        .unwrap_or_default();
    println!("\nPrimary recovers; waiting {} ms for the trial call.\n", wait.as_millis());
    jobs_graphql.set_healthy(true);
    jobs_rest.set_healthy(true);
    tokio::time::sleep(wait + Duration::from_millis(50)).await;

    let result = dispatcher.dispatch(search_jobs(&jobs_graphql, &jobs_rest)).await;
    report("searchJobs (recovered)", &result);

    println!("\nHealth snapshot:");
    println!("{}", dispatcher.health().to_json()?);

    if let Some(handle) = metrics_handle {
        println!("\nMetrics:");
        println!("{}", handle.render());
    }

    Ok(())
}
