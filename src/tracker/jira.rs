//! Jira REST API v2 client.
//!
//! Field updates go to `PUT /rest/api/2/issue/{key}` and comments to
//! `POST /rest/api/2/issue/{key}/comment`, authenticated with HTTP basic
//! auth (account email + API token).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{header, Client, Method, Response};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::{Config, ConfigResolutionError, JiraConfig, JiraCredentials, ProxyConfig};

use super::{IssueTracker, IssueUpdate, IssueUpdateOutcome};

#[derive(Debug, Error)]
pub enum JiraError {
    /// Base URL or credentials missing after tier resolution.
    #[error(transparent)]
    Config(#[from] ConfigResolutionError),

    #[error("Jira base URL {url:?} is invalid: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// Jira answered with a non-success status.
    #[error("Jira {action} failed ({status}): {detail}")]
    Api {
        action: &'static str,
        status: u16,
        detail: String,
    },

    /// Transport-level failure (connect, TLS, timeout).
    #[error("Jira request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl JiraError {
    /// True when the service itself is misconfigured.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidBaseUrl { .. })
    }
}

pub struct JiraClient {
    client: Client,
    settings: JiraConfig,
    env: String,
}

impl JiraClient {
    /// Builds the HTTP client once. Credentials are resolved per request so
    /// a service without Jira settings still starts.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(&config.jira, &config.app.env, &config.proxy)
    }

    pub fn new(settings: &JiraConfig, env: &str, proxy: &ProxyConfig) -> anyhow::Result<Self> {
        // Only the [proxy] section counts, not HTTP_PROXY from our own environment
        let mut builder = Client::builder()
            .timeout(Duration::from_secs_f64(settings.timeout_seconds))
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .no_proxy();

        let no_proxy = proxy
            .no_proxy
            .as_deref()
            .and_then(reqwest::NoProxy::from_string);
        if let Some(url) = proxy.http.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::http(url)?.no_proxy(no_proxy.clone()));
        }
        if let Some(url) = proxy.https.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::https(url)?.no_proxy(no_proxy));
        }

        Ok(Self {
            client: builder.build()?,
            settings: settings.clone(),
            env: env.to_string(),
        })
    }

    fn credentials(&self) -> Result<JiraCredentials, JiraError> {
        Ok(self.settings.credentials_for(&self.env)?)
    }

    async fn send(
        &self,
        creds: &JiraCredentials,
        method: Method,
        url: Url,
        body: Value,
        action: &'static str,
    ) -> Result<(), JiraError> {
        debug!("Jira {action}: {method} {url}");
        let response = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, basic_auth(creds))
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;

        check_status(response, action).await
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    async fn update_issue(&self, update: &IssueUpdate) -> Result<IssueUpdateOutcome, JiraError> {
        let creds = self.credentials()?;
        let key = update.issue_key.as_str();

        let mut outcome = IssueUpdateOutcome {
            issue_key: key.to_string(),
            fields_updated: false,
            comment_added: false,
        };

        if update.has_fields() {
            let url = issue_url(&creds.base_url, key, None)?;
            let body = json!({ "fields": update.fields });
            self.send(&creds, Method::PUT, url, body, "field update").await?;
            outcome.fields_updated = true;
        }

        if let Some(comment) = update.comment() {
            let url = issue_url(&creds.base_url, key, Some("comment"))?;
            let body = json!({ "body": comment });
            self.send(&creds, Method::POST, url, body, "comment update").await?;
            outcome.comment_added = true;
        }

        info!(
            "Jira issue {key} updated: fields={} comment={}",
            outcome.fields_updated, outcome.comment_added
        );
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "jira"
    }
}

fn basic_auth(creds: &JiraCredentials) -> String {
    let raw = format!("{}:{}", creds.user_email, creds.api_token);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// `{base}/rest/api/2/issue/{key}[/{suffix}]`, keeping any path prefix of
/// the base URL and percent-encoding the key.
fn issue_url(base: &str, key: &str, suffix: Option<&str>) -> Result<Url, JiraError> {
    let invalid = |reason: String| JiraError::InvalidBaseUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| invalid("cannot be a base URL".to_string()))?;
        segments
            .pop_if_empty()
            .extend(["rest", "api", "2", "issue", key]);
        if let Some(suffix) = suffix {
            segments.push(suffix);
        }
    }
    Ok(url)
}

async fn check_status(response: Response, action: &'static str) -> Result<(), JiraError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let detail = match body.trim() {
        "" => status.canonical_reason().unwrap_or_default().to_string(),
        trimmed => trimmed.to_string(),
    };
    Err(JiraError::Api {
        action,
        status: status.as_u16(),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{post, put};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// One request as seen by the fake Jira.
    #[derive(Debug, Clone)]
    struct Seen {
        method: &'static str,
        key: String,
        auth: Option<String>,
        body: Value,
    }

    #[derive(Clone, Default)]
    struct FakeJira {
        seen: Arc<Mutex<Vec<Seen>>>,
        fail_comments: bool,
    }

    async fn put_issue(
        State(fake): State<FakeJira>,
        Path(key): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        fake.seen.lock().unwrap().push(Seen {
            method: "PUT",
            key,
            auth: header_value(&headers),
            body,
        });
        StatusCode::NO_CONTENT
    }

    async fn post_comment(
        State(fake): State<FakeJira>,
        Path(key): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, String) {
        fake.seen.lock().unwrap().push(Seen {
            method: "POST",
            key,
            auth: header_value(&headers),
            body,
        });
        if fake.fail_comments {
            (StatusCode::FORBIDDEN, "  {\"errorMessages\":[\"no permission\"]}\n".into())
        } else {
            (StatusCode::CREATED, "{\"id\":\"10000\"}".into())
        }
    }

    fn header_value(headers: &HeaderMap) -> Option<String> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    /// Serves the fake on an ephemeral port, returns its base URL.
    async fn serve(fake: FakeJira) -> String {
        let app = Router::new()
            .route("/jira/rest/api/2/issue/{key}", put(put_issue))
            .route("/jira/rest/api/2/issue/{key}/comment", post(post_comment))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/jira/")
    }

    fn client(base_url: Option<String>) -> JiraClient {
        let settings = JiraConfig {
            base_url,
            user_email: Some("bot@example.com".into()),
            api_token: Some("secret".into()),
            environments: HashMap::new(),
            ..Default::default()
        };
        JiraClient::new(&settings, "dev", &ProxyConfig::default()).unwrap()
    }

    fn update(fields: Value, comment: Option<&str>) -> IssueUpdate {
        IssueUpdate {
            issue_key: "BT-42".into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            comment: comment.map(String::from),
        }
    }

    // ── URL building ────────────────────────────────────

    #[test]
    fn test_issue_url_plain_base() {
        let url = issue_url("https://jira.example.com", "BT-1", None).unwrap();
        assert_eq!(url.as_str(), "https://jira.example.com/rest/api/2/issue/BT-1");
    }

    #[test]
    fn test_issue_url_keeps_base_path() {
        let url = issue_url("https://example.com/jira/", "BT-1", Some("comment")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/jira/rest/api/2/issue/BT-1/comment");
    }

    #[test]
    fn test_issue_url_encodes_key() {
        let url = issue_url("https://jira.example.com", "BT-1/../x", None).unwrap();
        assert_eq!(url.path(), "/rest/api/2/issue/BT-1%2F..%2Fx");
    }

    #[test]
    fn test_issue_url_invalid_base() {
        let err = issue_url("not a url", "BT-1", None).unwrap_err();
        assert!(err.is_config());
        let err = issue_url("mailto:bot@example.com", "BT-1", None).unwrap_err();
        assert!(matches!(err, JiraError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn test_basic_auth_header() {
        let creds = JiraCredentials {
            base_url: String::new(),
            user_email: "bot@example.com".into(),
            api_token: "secret".into(),
        };
        // base64("bot@example.com:secret")
        assert_eq!(basic_auth(&creds), "Basic Ym90QGV4YW1wbGUuY29tOnNlY3JldA==");
    }

    // ── against a local fake ────────────────────────────

    #[tokio::test]
    async fn test_fields_then_comment() {
        let fake = FakeJira::default();
        let base = serve(fake.clone()).await;

        let outcome = client(Some(base))
            .update_issue(&update(json!({"summary": "New title"}), Some("Looks good")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IssueUpdateOutcome {
                issue_key: "BT-42".into(),
                fields_updated: true,
                comment_added: true,
            }
        );

        let seen = fake.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, "PUT");
        assert_eq!(seen[0].key, "BT-42");
        assert_eq!(seen[0].body, json!({"fields": {"summary": "New title"}}));
        assert_eq!(seen[1].method, "POST");
        assert_eq!(seen[1].body, json!({"body": "Looks good"}));
        assert_eq!(
            seen[0].auth.as_deref(),
            Some("Basic Ym90QGV4YW1wbGUuY29tOnNlY3JldA==")
        );
    }

    #[tokio::test]
    async fn test_comment_only_skips_put() {
        let fake = FakeJira::default();
        let base = serve(fake.clone()).await;

        let outcome = client(Some(base))
            .update_issue(&update(json!({}), Some("ping")))
            .await
            .unwrap();
        assert!(!outcome.fields_updated);
        assert!(outcome.comment_added);
        let seen = fake.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_trimmed_body() {
        let fake = FakeJira {
            fail_comments: true,
            ..Default::default()
        };
        let base = serve(fake.clone()).await;

        let err = client(Some(base))
            .update_issue(&update(json!({"labels": ["bt"]}), Some("nope")))
            .await
            .unwrap_err();
        match err {
            JiraError::Api {
                action,
                status,
                detail,
            } => {
                assert_eq!(action, "comment update");
                assert_eq!(status, 403);
                assert_eq!(detail, "{\"errorMessages\":[\"no permission\"]}");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
        // The field update went through before the comment failed
        assert_eq!(fake.seen.lock().unwrap()[0].method, "PUT");
    }

    #[tokio::test]
    async fn test_missing_base_url_is_config_error() {
        let err = client(None)
            .update_issue(&update(json!({}), Some("x")))
            .await
            .unwrap_err();
        match err {
            JiraError::Config(e) => assert_eq!(e.key, "base_url"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_http_error() {
        // Port 9 on loopback: nothing listens there in a test environment
        let err = client(Some("http://127.0.0.1:9".into()))
            .update_issue(&update(json!({"summary": "x"}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, JiraError::Http(_)));
        assert!(!err.is_config());
    }
}
