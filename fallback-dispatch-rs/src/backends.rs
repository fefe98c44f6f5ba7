//! # Backend Adapters
//!
//! Thin helpers that turn the usual three tiers into dispatcher callables:
//! a GraphQL endpoint, a legacy REST API and a static fallback value. They
//! know nothing about schemas; payloads are deserialized into whatever the
//! caller asks for.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::types::{Error, Result};

/// Longest slice of an error body carried into an error message
const MAX_BODY_IN_ERROR: usize = 256;

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_BODY_IN_ERROR {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(MAX_BODY_IN_ERROR).collect();
    truncated.push('…');
    truncated
}

async fn error_for_status(response: Response, backend: &str, target: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(
        status.as_u16(),
        format!("{} returned {}: {}", backend, status, truncate_body(&body)),
    )
    .context("target", target))
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: &'a Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

/// One entry of a GraphQL `errors` array
#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub path: Option<Vec<Value>>,
}

/// Primary tier: a GraphQL endpoint
#[derive(Debug, Clone)]
pub struct GraphqlBackend {
    client: Client,
    endpoint: Arc<str>,
}

impl GraphqlBackend {
    pub fn new<S: AsRef<str>>(endpoint: S) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    /// Shares an existing client (connection pool, default headers)
    pub fn with_client<S: AsRef<str>>(client: Client, endpoint: S) -> Self {
        Self {
            client,
            endpoint: Arc::from(endpoint.as_ref()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Posts `{query, variables}` and returns `data`.
    ///
    /// A response with a non-empty `errors` array is an `Application` error
    /// even when the HTTP status is 200.
    pub async fn query<T: DeserializeOwned>(&self, query: &str, variables: &Value) -> Result<T> {
        debug!(endpoint = %self.endpoint, "Sending GraphQL request");

        let response = self
            .client
            .post(self.endpoint.as_ref())
            .json(&GraphqlRequest { query, variables })
            .send()
            .await?;
        let response = error_for_status(response, "GraphQL endpoint", &self.endpoint).await?;

        let envelope: GraphqlResponse<T> = response.json().await?;
        if !envelope.errors.is_empty() {
            let messages: Vec<&str> = envelope.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(Error::application(format!("GraphQL errors: {}", messages.join("; ")))
                .context("target", self.endpoint.as_ref())
                .context("error_count", envelope.errors.len()));
        }

        envelope
            .data
            .ok_or_else(|| Error::application("GraphQL response carried no data"))
    }

    /// Callable that runs `query` with `variables` on every invocation
    pub fn callable<T, Q>(
        &self,
        query: Q,
        variables: Value,
    ) -> impl Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
    where
        T: DeserializeOwned + Send + 'static,
        Q: Into<String>,
    {
        let backend = self.clone();
        let query: Arc<str> = Arc::from(query.into());
        let variables = Arc::new(variables);

        move || {
            let backend = backend.clone();
            let query = query.clone();
            let variables = variables.clone();
            async move { backend.query(&query, &variables).await }.boxed()
        }
    }
}

/// Secondary tier: a JSON REST API
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Arc<str>,
}

impl RestBackend {
    pub fn new<S: AsRef<str>>(base_url: S) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client<S: AsRef<str>>(client: Client, base_url: S) -> Self {
        Self {
            client,
            base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GETs `path` relative to the base URL and decodes the JSON body
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "Sending REST request");

        let response = self.client.get(&url).send().await?;
        let response = error_for_status(response, "REST API", &url).await?;
        Ok(response.json().await?)
    }

    /// Callable that GETs `path` on every invocation
    pub fn callable<T>(
        &self,
        path: impl Into<String>,
    ) -> impl Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let backend = self.clone();
        let path: Arc<str> = Arc::from(path.into());

        move || {
            let backend = backend.clone();
            let path = path.clone();
            async move { backend.get(&path).await }.boxed()
        }
    }
}

/// Terminal tier: always answers with a fixed value
#[derive(Debug, Clone)]
pub struct StaticBackend<T> {
    value: Arc<T>,
}

impl<T: Clone + Send + Sync + 'static> StaticBackend<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn callable(&self) -> impl Fn() -> future::Ready<Result<T>> + Send + Sync + 'static {
        let value = self.value.clone();
        move || future::ready(Ok(T::clone(&value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::types::ErrorKind;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: String,
        email: String,
    }

    #[derive(Debug, Deserialize)]
    struct UserData {
        user: User,
    }

    #[tokio::test]
    async fn test_graphql_returns_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_partial_json(json!({"variables": {"id": "u-1"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"user": {"id": "u-1", "email": "ada@example.com"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = GraphqlBackend::new(format!("{}/graphql", server.uri()));
        let data: UserData = backend
            .query("query($id: ID!) { user(id: $id) { id email } }", &json!({"id": "u-1"}))
            .await
            .unwrap();

        assert_eq!(data.user.email, "ada@example.com");
    }

    #[tokio::test]
    async fn test_graphql_errors_array_is_application_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [
                    {"message": "Cannot query field \"salary\"", "path": ["jobs"]},
                    {"message": "Unauthorized"}
                ]
            })))
            .mount(&server)
            .await;

        let backend = GraphqlBackend::new(server.uri());
        let err = backend.query::<Value>("{ jobs { salary } }", &json!({})).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Application);
        assert!(err.message.contains("salary"));
        assert!(err.message.contains("Unauthorized"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_graphql_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
            .mount(&server)
            .await;

        let backend = GraphqlBackend::new(server.uri());
        let err = backend.query::<Value>("{ ping }", &json!({})).await.unwrap_err();

        assert_eq!(err.status, Some(503));
        assert_eq!(err.kind, ErrorKind::External);
        assert!(err.message.contains("upstream overloaded"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_graphql_callable_repeats_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": 7})))
            .expect(2)
            .mount(&server)
            .await;

        let call = GraphqlBackend::new(server.uri()).callable::<u32, _>("{ count }", json!({}));
        assert_eq!(call().await.unwrap(), 7);
        assert_eq!(call().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_rest_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u-1", "email": "ada@example.com"
            })))
            .mount(&server)
            .await;

        let backend = RestBackend::new(format!("{}/", server.uri()));
        let user: User = backend.callable("/api/users/u-1")().await.unwrap();
        assert_eq!(
            user,
            User {
                id: "u-1".to_string(),
                email: "ada@example.com".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rest_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/throttled"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let backend = RestBackend::new(server.uri());

        let err = backend.get::<Value>("missing").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.is_retryable());

        let err = backend.get::<Value>("throttled").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_communication_error() {
        // Nothing listens on port 9 (discard) on a test host
        let backend = RestBackend::new("http://127.0.0.1:9");
        let err = backend.get::<Value>("/health").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Communication);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_static_backend() {
        let backend = StaticBackend::new(vec!["Rust Engineer".to_string()]);
        let call = backend.callable();
        assert_eq!(call().await.unwrap(), vec!["Rust Engineer".to_string()]);
        assert_eq!(backend.value().len(), 1);
    }

    #[test]
    fn test_truncate_body() {
        let long = "e".repeat(1_000);
        assert_eq!(truncate_body(&long).chars().count(), MAX_BODY_IN_ERROR + 1);
        assert_eq!(truncate_body("short"), "short");
    }
}
