// Persistence transport for namespaces, event sources and triggers

//! # Persistence Transport
//!
//! The trigger store never talks to storage directly. Every remote write goes
//! through a [`PersistenceTransport`], which mirrors the trigger API:
//!
//! | Call | Request |
//! |---|---|
//! | [`put_namespace`](PersistenceTransport::put_namespace) | `PUT /namespace/{name}` |
//! | [`delete_namespace`](PersistenceTransport::delete_namespace) | `DELETE /namespace/{name}` |
//! | [`put_event_source`](PersistenceTransport::put_event_source) | `PUT /namespace/{name}/eventsource/{source}` |
//! | [`post_triggers`](PersistenceTransport::post_triggers) | `POST /namespace/{name}/trigger` with `{"triggers": [...]}` |
//!
//! ## Status Mapping
//!
//! - any 2xx → `Ok(body)`
//! - 409 → [`TriggerflowError::ResourceAlreadyExists`] carrying the body
//! - anything else → [`TriggerflowError::Transport`] carrying status and body
//!
//! Transport failures are not retried here; callers own their retry policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use super::Credentials;
use crate::models::{EventSource, Trigger};
use crate::{Result, TriggerflowError};

/// Remote persistence contract used by the trigger store
#[async_trait]
pub trait PersistenceTransport: Send + Sync {
    /// Create a namespace with its global context and optional event source
    async fn put_namespace(
        &self,
        namespace: &str,
        global_context: &Map<String, Value>,
        event_source: Option<&EventSource>,
    ) -> Result<Value>;

    /// Delete a namespace and everything in it
    async fn delete_namespace(&self, namespace: &str) -> Result<Value>;

    /// Register an event source on a namespace
    async fn put_event_source(
        &self,
        namespace: &str,
        event_source: &EventSource,
        overwrite: bool,
    ) -> Result<Value>;

    /// Submit a batch of triggers in one request
    async fn post_triggers(&self, namespace: &str, triggers: &[Trigger]) -> Result<Value>;
}

/// HTTP implementation of the transport with basic authentication
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    endpoint: Url,
    credentials: Credentials,
}

impl HttpTransport {
    /// Default request timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build a transport for `endpoint`
    ///
    /// Fails with a validation error if the endpoint is not an absolute
    /// http(s) URL. No request is sent.
    pub fn new(endpoint: &str, credentials: Credentials) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| TriggerflowError::Validation(format!("Invalid API endpoint '{}': {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() || !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TriggerflowError::Validation(format!(
                "API endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        let http = HttpClient::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| TriggerflowError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            credentials,
        })
    }

    /// Endpoint URL extended with path segments (each segment is escaped)
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(self.credentials.user(), Some(self.credentials.password()))
    }
}

/// Map an HTTP response onto the transport status contract
async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await?;
    debug!("{}: {}", status, body);

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    } else if status == StatusCode::CONFLICT {
        Err(TriggerflowError::ResourceAlreadyExists(body))
    } else {
        Err(TriggerflowError::Transport {
            status: Some(status.as_u16()),
            body,
        })
    }
}

#[async_trait]
impl PersistenceTransport for HttpTransport {
    async fn put_namespace(
        &self,
        namespace: &str,
        global_context: &Map<String, Value>,
        event_source: Option<&EventSource>,
    ) -> Result<Value> {
        let url = self.url(&["namespace", namespace]);
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(&json!({
                "global_context": global_context,
                "event_source": event_source,
            }))
            .send()
            .await?;
        handle_response(response).await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<Value> {
        let url = self.url(&["namespace", namespace]);
        let response = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn put_event_source(
        &self,
        namespace: &str,
        event_source: &EventSource,
        overwrite: bool,
    ) -> Result<Value> {
        let url = self.url(&["namespace", namespace, "eventsource", &event_source.name]);
        let response = self
            .request(reqwest::Method::PUT, url)
            .query(&[("overwrite", overwrite)])
            .json(&json!({ "eventsource": event_source }))
            .send()
            .await?;
        handle_response(response).await
    }

    async fn post_triggers(&self, namespace: &str, triggers: &[Trigger]) -> Result<Value> {
        let url = self.url(&["namespace", namespace, "trigger"]);
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({ "triggers": triggers }))
            .send()
            .await?;
        handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudEvent;
    use mockito::Matcher;

    // base64("tester:secret1")
    const AUTH_HEADER: &str = "Basic dGVzdGVyOnNlY3JldDE=";

    fn transport(url: &str) -> HttpTransport {
        HttpTransport::new(url, Credentials::new("tester", "secret1").unwrap()).unwrap()
    }

    fn trigger(id: &str) -> Trigger {
        Trigger {
            trigger_id: id.to_string(),
            condition: "true".to_string(),
            action: "pass".to_string(),
            context: Map::new(),
            depends_on_events: vec![CloudEvent::new("init__")],
            transient: false,
        }
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        let credentials = Credentials::new("tester", "secret1").unwrap();
        assert!(matches!(
            HttpTransport::new("not a url", credentials.clone()),
            Err(TriggerflowError::Validation(_))
        ));
        assert!(matches!(
            HttpTransport::new("nats://localhost:4222", credentials),
            Err(TriggerflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_put_namespace_sends_context_with_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/namespace/run1")
            .match_header("authorization", AUTH_HEADER)
            .match_body(Matcher::PartialJson(json!({
                "global_context": {"namespace": "run1"},
                "event_source": null,
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"namespace": "run1"}"#)
            .create_async()
            .await;

        let mut context = Map::new();
        context.insert("namespace".to_string(), json!("run1"));

        let body = transport(&server.url())
            .put_namespace("run1", &context, None)
            .await
            .unwrap();
        assert_eq!(body, json!({"namespace": "run1"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_namespace_sends_no_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/namespace/run1")
            .match_header("authorization", AUTH_HEADER)
            .match_header("content-type", Matcher::Missing)
            .match_body("")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"namespace": "run1"}"#)
            .create_async()
            .await;

        let body = transport(&server.url()).delete_namespace("run1").await.unwrap();
        assert_eq!(body, json!({"namespace": "run1"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_conflict_maps_to_already_exists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/namespace/run1")
            .with_status(409)
            .with_body(r#"{"error": "Namespace run1 already exists"}"#)
            .create_async()
            .await;

        let err = transport(&server.url())
            .put_namespace("run1", &Map::new(), None)
            .await
            .unwrap_err();
        match err {
            TriggerflowError::ResourceAlreadyExists(body) => assert!(body.contains("already exists")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_failures_carry_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/namespace/run1/trigger")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = transport(&server.url())
            .post_triggers("run1", &[trigger("t1")])
            .await
            .unwrap_err();
        match err {
            TriggerflowError::Transport { status, body } => {
                assert_eq!(status, Some(500));
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_triggers_wraps_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/namespace/run1/trigger")
            .match_body(Matcher::PartialJson(json!({
                "triggers": [
                    {"trigger_id": "t1", "depends_on_events": [{"subject": "init__"}]},
                    {"trigger_id": "t2"}
                ]
            })))
            .with_status(201)
            .with_body(r#"{"triggers": ["t1", "t2"]}"#)
            .create_async()
            .await;

        let body = transport(&server.url())
            .post_triggers("run1", &[trigger("t1"), trigger("t2")])
            .await
            .unwrap();
        assert_eq!(body["triggers"][1], "t2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_event_source_path_and_overwrite_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", Matcher::Regex(r"^/namespace/run1/eventsource/src1".to_string()))
            .match_query(Matcher::UrlEncoded("overwrite".to_string(), "true".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "eventsource": {"name": "src1", "event_source_type": "memory", "topic": "t"}
            })))
            .with_status(200)
            .create_async()
            .await;

        let body = transport(&server.url())
            .put_event_source("run1", &EventSource::memory("src1", "t"), true)
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
        mock.assert_async().await;
    }
}
