//! The `http` node and the HTTP client it calls through.

use crate::approval::{ApprovalDecision, ProposedAction};
use crate::error::NodeError;
use crate::handler::{NodeContext, NodeHandler, NodeOutcome, NodeOutput, parse_config};
use crate::interpolate::stringify;
use crate::node::NodeKind;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// A fully resolved HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<JsonValue>,
}

const REDACTED: &str = "[redacted]";

/// Header names whose values never leave the engine.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
];

fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&name.as_str())
        || name.contains("token")
        || name.contains("secret")
        || name.contains("password")
}

/// Copies `headers` with credential values replaced, for display and storage.
fn redacted_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// An HTTP response with its body decoded.
///
/// JSON bodies are parsed; anything else is kept as a string.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: JsonValue,
}

impl HttpResponse {
    /// Creates a response with no headers.
    #[must_use]
    pub fn new(status: u16, body: JsonValue) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level HTTP failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request could not be built.
    InvalidRequest { reason: String },
    /// The connection failed.
    Connection { reason: String },
    /// No response in time.
    Timeout,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest { reason } => write!(f, "invalid HTTP request: {reason}"),
            Self::Connection { reason } => write!(f, "HTTP connection failed: {reason}"),
            Self::Timeout => write!(f, "HTTP request timed out"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Sends HTTP requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures. Error statuses are
    /// ordinary responses.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::InvalidRequest {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| HttpError::InvalidRequest {
                reason: e.to_string(),
            })?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            None | Some(JsonValue::Null) => builder,
            Some(JsonValue::String(text)) => builder.body(text.clone()),
            Some(body) => builder.json(body),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else if e.is_builder() {
                HttpError::InvalidRequest {
                    reason: e.to_string(),
                }
            } else {
                HttpError::Connection {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let text = response.text().await.map_err(|e| HttpError::Connection {
            reason: e.to_string(),
        })?;
        let body = if text.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        };
        debug!(status, "HTTP response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Configuration of an `http` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpNodeConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default, rename = "failOnNon2xx")]
    pub fail_on_non_2xx: Option<bool>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl HttpNodeConfig {
    fn request(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.to_ascii_uppercase(),
            url: self.url.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect(),
            body: self.body.clone(),
        }
    }
}

fn is_safe_method(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

/// Performs one HTTP call.
pub struct HttpHandler {
    client: Arc<dyn HttpClient>,
}

impl HttpHandler {
    /// Creates a handler over a client.
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for HttpHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Http
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), String> {
        let config: HttpNodeConfig = parse_config(config)?;
        if config.url.trim().is_empty() {
            return Err("url must not be empty".to_string());
        }
        reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map(|_| ())
            .map_err(|_| format!("invalid HTTP method '{}'", config.method))
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let config: HttpNodeConfig = ctx.parse_config()?;
        let request = config.request();

        if config.requires_approval && ctx.approval() != Some(ApprovalDecision::Approved) {
            return Ok(NodeOutcome::ApprovalRequired {
                action: ProposedAction::new(
                    format!("{} {}", request.method, request.url),
                    json!({
                        "method": request.method,
                        "url": request.url,
                        "headers": redacted_headers(&request.headers),
                        "body": request.body,
                    }),
                ),
                continuation: None,
            });
        }

        let response = self.client.send(&request).await.map_err(|e| match e {
            HttpError::InvalidRequest { reason } => NodeError::InvalidConfig { reason },
            other => NodeError::transient(other.to_string()),
        })?;

        if response.status == 429 {
            return Err(NodeError::Transient {
                reason: "HTTP 429 Too Many Requests".to_string(),
                retry_after_secs: response.retry_after_secs(),
                continuation: None,
            });
        }
        if response.status >= 500 {
            return Err(NodeError::transient(format!(
                "HTTP {} from {}",
                response.status, request.url
            )));
        }
        let fail_on_non_2xx = config
            .fail_on_non_2xx
            .unwrap_or(ctx.settings.http_fail_on_non_2xx);
        if fail_on_non_2xx && !response.is_success() {
            return Err(NodeError::HttpStatus {
                status: response.status,
                body: response.body,
            });
        }

        let value = json!({
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        });
        Ok(NodeOutcome::Completed(if is_safe_method(&request.method) {
            NodeOutput::pure(value)
        } else {
            NodeOutput::with_side_effects(value)
        }))
    }
}
