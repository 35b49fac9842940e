//! Arcade tool provider.
//!
//! Arcade hosts OAuth-backed tools (Gmail, Slack, ...) and keeps the user
//! tokens on its side. Each call first asks Arcade whether the user has
//! authorized the tool; if not, the authorization URL is surfaced as
//! [`ToolInvocationError::AuthRequired`].

use crate::error::ToolInvocationError;
use crate::tool::{ToolInvocation, ToolInvoker, ToolTarget};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Connection settings for Arcade.
#[derive(Debug, Clone, Deserialize)]
pub struct ArcadeConfig {
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key.
    pub api_key: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.arcade.dev".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// [`ToolInvoker`] backed by the Arcade HTTP API.
pub struct ArcadeToolInvoker {
    client: reqwest::Client,
    config: ArcadeConfig,
}

impl ArcadeToolInvoker {
    /// Creates a new invoker.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ArcadeConfig) -> Result<Self, ToolInvocationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ToolInvocationError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    async fn post(&self, path: &str, body: JsonValue) -> Result<(u16, JsonValue), ToolInvocationError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolInvocationError::from_transport(&e))?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ToolInvocationError::RateLimited { retry_after_secs });
        }

        let body = response
            .json::<JsonValue>()
            .await
            .map_err(|e| ToolInvocationError::from_transport(&e))?;
        Ok((status, body))
    }
}

#[async_trait]
impl ToolInvoker for ArcadeToolInvoker {
    #[instrument(skip(self, invocation), fields(tool = %invocation.target.label()))]
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<JsonValue, ToolInvocationError> {
        let ToolTarget::Arcade { tool_id } = &invocation.target else {
            return Err(ToolInvocationError::Unsupported {
                target: invocation.target.label(),
            });
        };
        let user_id = invocation.credential.user_id.clone().unwrap_or_default();

        let (status, body) = self
            .post(
                "/v1/tools/authorize",
                json!({ "tool_name": tool_id, "user_id": user_id }),
            )
            .await?;
        check_status(tool_id, status, &body)?;
        check_authorization(tool_id, &body)?;
        debug!("tool authorized");

        let (status, body) = self
            .post(
                "/v1/tools/execute",
                json!({
                    "tool_name": tool_id,
                    "input": invocation.input,
                    "user_id": user_id,
                }),
            )
            .await?;
        check_status(tool_id, status, &body)?;
        parse_execute_response(tool_id, &body)
    }

    fn supports(&self, target: &ToolTarget) -> bool {
        matches!(target, ToolTarget::Arcade { .. })
    }
}

fn check_status(tool: &str, status: u16, body: &JsonValue) -> Result<(), ToolInvocationError> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    let reason = body
        .get("message")
        .or_else(|| body.get("error"))
        .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
        .unwrap_or_else(|| format!("request for {tool} rejected"));
    Err(ToolInvocationError::ServiceError { status, reason })
}

/// Interprets an authorization status response.
fn check_authorization(tool: &str, body: &JsonValue) -> Result<(), ToolInvocationError> {
    match body.get("status").and_then(JsonValue::as_str) {
        Some("completed") => Ok(()),
        Some("failed") => Err(ToolInvocationError::Failed {
            tool: tool.to_string(),
            reason: "authorization failed".to_string(),
        }),
        _ => Err(ToolInvocationError::AuthRequired {
            tool: tool.to_string(),
            authorization_url: body.get("url").and_then(JsonValue::as_str).map(str::to_string),
            authorization_id: body.get("id").and_then(JsonValue::as_str).map(str::to_string),
        }),
    }
}

/// Extracts the tool's value from an execute response.
fn parse_execute_response(tool: &str, body: &JsonValue) -> Result<JsonValue, ToolInvocationError> {
    let output = body.get("output").cloned().unwrap_or(JsonValue::Null);

    if let Some(auth) = output.get("authorization").filter(|a| !a.is_null()) {
        check_authorization(tool, auth)?;
    }

    if let Some(error) = output.get("error").filter(|e| !e.is_null()) {
        let reason = error
            .get("message")
            .and_then(JsonValue::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(ToolInvocationError::Failed {
            tool: tool.to_string(),
            reason,
        });
    }

    if body.get("success").and_then(JsonValue::as_bool) == Some(false) {
        return Err(ToolInvocationError::Failed {
            tool: tool.to_string(),
            reason: "tool reported failure".to_string(),
        });
    }

    Ok(output.get("value").cloned().unwrap_or(JsonValue::Null))
}
