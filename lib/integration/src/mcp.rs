//! MCP tool provider over the streamable HTTP transport.
//!
//! Only `tools/call` is used; tool discovery happens at authoring time.

use crate::error::ToolInvocationError;
use crate::tool::{ToolInvocation, ToolInvoker, ToolTarget};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::instrument;

/// [`ToolInvoker`] that calls tools on MCP servers.
pub struct McpToolInvoker {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl McpToolInvoker {
    /// Creates a new invoker.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, bearer_token: Option<String>) -> Result<Self, ToolInvocationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolInvocationError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            bearer_token,
        })
    }
}

#[async_trait]
impl ToolInvoker for McpToolInvoker {
    #[instrument(skip(self, invocation), fields(tool = %invocation.target.label()))]
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<JsonValue, ToolInvocationError> {
        let ToolTarget::Mcp {
            url,
            tool_name,
            auth_type,
        } = &invocation.target
        else {
            return Err(ToolInvocationError::Unsupported {
                target: invocation.target.label(),
            });
        };

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&call_request(tool_name, &invocation.input));
        if auth_type.as_deref() == Some("bearer")
            && let Some(token) = &self.bearer_token
        {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolInvocationError::from_transport(&e))?;
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(ToolInvocationError::AuthRequired {
                tool: tool_name.clone(),
                authorization_url: None,
                authorization_id: None,
            });
        }
        if status == 429 {
            return Err(ToolInvocationError::RateLimited {
                retry_after_secs: None,
            });
        }
        if !(200..300).contains(&status) {
            return Err(ToolInvocationError::ServiceError {
                status,
                reason: format!("MCP server rejected call to {tool_name}"),
            });
        }

        let body = response
            .json::<JsonValue>()
            .await
            .map_err(|e| ToolInvocationError::from_transport(&e))?;
        parse_call_response(tool_name, &body)
    }

    fn supports(&self, target: &ToolTarget) -> bool {
        matches!(target, ToolTarget::Mcp { .. })
    }
}

fn call_request(tool_name: &str, arguments: &JsonValue) -> JsonValue {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": tool_name, "arguments": arguments },
    })
}

/// Unwraps a JSON-RPC `tools/call` response.
///
/// Structured content wins; otherwise the text parts are joined.
fn parse_call_response(tool: &str, body: &JsonValue) -> Result<JsonValue, ToolInvocationError> {
    if let Some(error) = body.get("error") {
        let reason = error
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ToolInvocationError::Failed {
            tool: tool.to_string(),
            reason,
        });
    }

    let result = body.get("result").cloned().unwrap_or(JsonValue::Null);
    let text: Vec<&str> = result
        .get("content")
        .and_then(JsonValue::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(JsonValue::as_str))
                .collect()
        })
        .unwrap_or_default();

    if result.get("isError").and_then(JsonValue::as_bool) == Some(true) {
        return Err(ToolInvocationError::Failed {
            tool: tool.to_string(),
            reason: text.join("\n"),
        });
    }

    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    Ok(JsonValue::String(text.join("\n")))
}
