//! End-to-end chains over real HTTP: GraphQL primary, REST secondary and a
//! static fallback, served by wiremock.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fallback_dispatch::{
    CircuitState, DispatchError, Dispatcher, DispatcherConfig, ErrorKind, GraphqlBackend,
    OperationDescriptor, RestBackend, RetryConfig, RetryPolicy, StaticBackend,
};

const SEARCH_JOBS: &str = "query($q: String!) { jobs(query: $q) { id title } }";

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct Job {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct JobsData {
    jobs: Vec<Job>,
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(
        "fast",
        Some(RetryConfig {
            max_retries: 2,
            base_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_delay_ms: 100,
        }),
    )
}

fn mock_jobs() -> Vec<Job> {
    vec![Job {
        id: "mock-1".to_string(),
        title: "Sample listing".to_string(),
    }]
}

fn search_jobs(graphql: &GraphqlBackend, rest: &RestBackend) -> OperationDescriptor<Vec<Job>> {
    let graphql_call = graphql.callable::<JobsData, _>(SEARCH_JOBS, json!({"q": "rust"}));
    let rest_call = rest.callable::<Vec<Job>>("/api/jobs?q=rust");

    OperationDescriptor::new("searchJobs")
        .retry_policy(fast_retries())
        .attempt("primary", move || {
            let call = graphql_call();
            async move { call.await.map(|data| data.jobs) }
        })
        .attempt("secondary", rest_call)
        .attempt("mock", StaticBackend::new(mock_jobs()).callable())
}

async fn servers() -> (MockServer, MockServer) {
    (MockServer::start().await, MockServer::start().await)
}

#[test_log::test(tokio::test)]
async fn primary_outage_is_served_by_rest() {
    let (gql, rest) = servers().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&gql)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "rest-1", "title": "Rust Engineer"}
        ])))
        .expect(1)
        .mount(&rest)
        .await;

    let dispatcher = Dispatcher::default();
    let result = dispatcher
        .dispatch(search_jobs(&GraphqlBackend::new(gql.uri()), &RestBackend::new(rest.uri())))
        .await;

    let (jobs, answer) = result.into_result().expect("REST should answer");
    assert_eq!(answer.backend_id, "secondary");
    assert!(answer.is_degraded);
    assert_eq!(jobs[0].id, "rest-1");
    assert_eq!(answer.failures.len(), 1);
    assert_eq!(answer.failures[0].kind, ErrorKind::External);
    assert_eq!(answer.failures[0].invocations, 3);
}

#[test_log::test(tokio::test)]
async fn graphql_errors_fall_through_to_static_data() {
    let (gql, rest) = servers().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{"message": "Cannot query field \"jobs\" on type \"Query\""}]
        })))
        // Application errors are not retried
        .expect(1)
        .mount(&gql)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&rest)
        .await;

    let dispatcher = Dispatcher::default();
    let result = dispatcher
        .dispatch(search_jobs(&GraphqlBackend::new(gql.uri()), &RestBackend::new(rest.uri())))
        .await;

    assert!(result.is_success());
    assert_eq!(result.answered_by.as_deref(), Some("mock"));
    assert_eq!(result.value, Some(mock_jobs()));

    let kinds: Vec<ErrorKind> = result.failures.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![ErrorKind::Application, ErrorKind::External]);
    assert!(result.failures[0].reason.contains("Cannot query field"));
}

#[test_log::test(tokio::test)]
async fn open_circuit_stops_calling_the_primary() {
    let (gql, rest) = servers().await;
    // Three dispatches with retries disabled trip the breaker; the fourth
    // must not reach the server at all.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&gql)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(4)
        .mount(&rest)
        .await;

    let dispatcher = Dispatcher::default();
    let graphql = GraphqlBackend::new(gql.uri());
    let rest_backend = RestBackend::new(rest.uri());

    for _ in 0..4 {
        let result = dispatcher
            .dispatch(search_jobs(&graphql, &rest_backend).retry_policy(RetryPolicy::never()))
            .await;
        assert_eq!(result.answered_by.as_deref(), Some("secondary"));
    }

    let health = dispatcher.health();
    let primary = health.get("primary").unwrap();
    assert_eq!(primary.state, CircuitState::Open);
    assert_eq!(primary.consecutive_failures, 3);
    assert_eq!(primary.total_skips, 1);
    assert!(primary.time_until_retry() > Duration::from_secs(59));

    let secondary = health.get("secondary").unwrap();
    assert_eq!(secondary.total_successes, 4);
    assert!(health.get("mock").is_none());
}

#[test_log::test(tokio::test)]
async fn exhausted_chain_reports_every_backend() {
    let (gql, rest) = servers().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&gql)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&rest)
        .await;

    let graphql_call = GraphqlBackend::new(gql.uri()).callable::<Value, _>("{ me { id } }", json!({}));
    let rest_call = RestBackend::new(rest.uri()).callable::<Value>("/api/me");

    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let result = dispatcher
        .dispatch(
            OperationDescriptor::new("getMe")
                .attempt("primary", graphql_call)
                .attempt("secondary", rest_call),
        )
        .await;

    assert!(!result.is_success());
    let err = result.into_result().unwrap_err();
    match &err {
        DispatchError::AllBackendsExhausted { operation, failures } => {
            assert_eq!(operation, "getMe");
            assert_eq!(failures[0].kind, ErrorKind::Authentication);
            assert_eq!(failures[1].kind, ErrorKind::NotFound);
            // Neither status is retryable
            assert!(failures.iter().all(|f| f.invocations == 1));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("primary"));
    assert!(err.to_string().contains("secondary"));
    assert!(!err.user_message().contains("401"));
}

#[test_log::test(tokio::test)]
async fn health_snapshot_serializes_for_dashboards() {
    let (gql, rest) = servers().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&gql)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&rest)
        .await;

    let dispatcher = Dispatcher::default();
    dispatcher
        .dispatch(search_jobs(&GraphqlBackend::new(gql.uri()), &RestBackend::new(rest.uri())))
        .await;

    let json: Value = serde_json::from_str(&dispatcher.health().to_json().unwrap()).unwrap();
    let backends = json["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 2);
    assert_eq!(backends[0]["backend_id"], "primary");
    assert_eq!(backends[0]["consecutive_failures"], 1);
    assert_eq!(backends[0]["is_open"], false);
    assert!(backends[0]["last_failure_reason"]
        .as_str()
        .unwrap()
        .contains("500"));
    assert_eq!(backends[1]["backend_id"], "secondary");
    assert!(json["captured_at"].is_string());
}
