//! OpenAI-compatible chat-completions backend.
//!
//! Works with any provider speaking the `/chat/completions` dialect with
//! function tools (OpenAI, Groq, OpenRouter, local gateways).

use crate::backend::{
    ChatMessage, LlmBackend, LlmReply, LlmRequest, LlmResponse, MessageRole, TokenUsage, ToolCall,
};
use crate::error::LlmError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Connection settings for an OpenAI-compatible provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    /// API base URL, up to and including the version segment.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key.
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// [`LlmBackend`] for OpenAI-compatible chat-completions APIs.
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiCompatibleBackend {
    /// Creates a new backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::InvalidConfig {
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut builder = self.client.post(url).json(&request_body(request));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::ProviderUnavailable {
                    provider: self.provider().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(LlmError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(LlmError::ProviderUnavailable {
                provider: self.provider().to_string(),
                reason: format!("status {status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                reason: format!("status {status}: {body}"),
            });
        }

        let body = response
            .json::<JsonValue>()
            .await
            .map_err(|e| LlmError::ResponseParseFailed {
                reason: e.to_string(),
            })?;
        let parsed = parse_response(&body, &request.model)?;
        debug!(tokens = parsed.usage.total(), "chat completion received");
        Ok(parsed)
    }

    fn provider(&self) -> &str {
        "openai-compatible"
    }
}

fn message_json(message: &ChatMessage) -> JsonValue {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut value = json!({ "role": role, "content": message.content });
    if let Some(call) = &message.tool_call {
        value["content"] = JsonValue::Null;
        value["tool_calls"] = json!([{
            "id": call.id,
            "type": "function",
            "function": { "name": call.name, "arguments": call.arguments.to_string() },
        }]);
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

/// Builds the chat-completions request body.
fn request_body(request: &LlmRequest) -> JsonValue {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages.iter().map(message_json).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

/// Parses a chat-completions response. Only the first choice and its first
/// tool call are used.
fn parse_response(body: &JsonValue, requested_model: &str) -> Result<LlmResponse, LlmError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::ResponseParseFailed {
            reason: "response has no choices".to_string(),
        })?;

    let reply = match message.pointer("/tool_calls/0") {
        Some(call) => {
            let name = call
                .pointer("/function/name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| LlmError::ResponseParseFailed {
                    reason: "tool call without a function name".to_string(),
                })?;
            let raw_args = call
                .pointer("/function/arguments")
                .and_then(JsonValue::as_str)
                .unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args)
                .unwrap_or_else(|_| JsonValue::String(raw_args.to_string()));
            LlmReply::ToolCall {
                call: ToolCall {
                    id: call
                        .get("id")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: name.to_string(),
                    arguments,
                },
            }
        }
        None => LlmReply::Text {
            text: message
                .get("content")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    };

    let usage = TokenUsage {
        input_tokens: token_count(body, "/usage/prompt_tokens"),
        output_tokens: token_count(body, "/usage/completion_tokens"),
    };
    let model = body
        .get("model")
        .and_then(JsonValue::as_str)
        .unwrap_or(requested_model)
        .to_string();

    Ok(LlmResponse {
        reply,
        usage,
        model,
    })
}

fn token_count(body: &JsonValue, pointer: &str) -> u32 {
    body.pointer(pointer)
        .and_then(JsonValue::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}
