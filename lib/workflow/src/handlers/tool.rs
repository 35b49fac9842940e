//! The tool-integration node (`arcade`, alias `tool`).
//!
//! Calls one external tool on behalf of a user. A tool the user has not
//! authorized yet suspends the run instead of failing it.

use crate::approval::{ApprovalDecision, ProposedAction};
use crate::error::NodeError;
use crate::handler::{NodeContext, NodeHandler, NodeOutcome, NodeOutput, parse_config};
use crate::node::NodeKind;
use async_trait::async_trait;
use flowrun_integration::{CredentialRef, ToolInvocation, ToolInvocationError, ToolInvoker, ToolTarget};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::debug;

/// Configuration of a tool-integration node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolNodeConfig {
    pub tool_id: String,
    #[serde(default)]
    pub inputs: Option<JsonValue>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// Maps an invoker failure onto the node error taxonomy.
pub(crate) fn node_error(err: ToolInvocationError) -> NodeError {
    let transient = err.is_transient();
    match err {
        ToolInvocationError::AuthRequired {
            tool,
            authorization_url,
            ..
        } => NodeError::AuthRequired {
            tool,
            authorization_url,
            continuation: None,
        },
        ToolInvocationError::RateLimited { retry_after_secs } => NodeError::Transient {
            reason: "tool provider rate limit".to_string(),
            retry_after_secs,
            continuation: None,
        },
        ToolInvocationError::Failed { tool, reason }
        | ToolInvocationError::InvalidInput { tool, reason } => NodeError::ToolFailed {
            tool,
            reason,
            transcript: Vec::new(),
        },
        other if transient => NodeError::transient(other.to_string()),
        other => NodeError::fatal(other.to_string()),
    }
}

/// Invokes a named external tool.
pub struct ToolHandler {
    invoker: Arc<dyn ToolInvoker>,
}

impl ToolHandler {
    /// Creates a handler over an invoker.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl NodeHandler for ToolHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), String> {
        let config: ToolNodeConfig = parse_config(config)?;
        if config.tool_id.trim().is_empty() {
            return Err("toolId must not be empty".to_string());
        }
        match config.inputs {
            None | Some(JsonValue::Object(_) | JsonValue::String(_)) => Ok(()),
            Some(_) => Err("inputs must be an object".to_string()),
        }
    }

    fn output_key(&self, config: &JsonValue) -> Option<String> {
        parse_config::<ToolNodeConfig>(config).ok()?.output_key
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let config: ToolNodeConfig = ctx.parse_config()?;
        let input = config.inputs.clone().unwrap_or_else(|| json!({}));
        let credential = config
            .user_id
            .clone()
            .or_else(|| ctx.settings.default_user_id.clone())
            .map(CredentialRef::user)
            .unwrap_or_default();

        if config.requires_approval && ctx.approval() != Some(ApprovalDecision::Approved) {
            return Ok(NodeOutcome::ApprovalRequired {
                action: ProposedAction::new(
                    format!("call {}", config.tool_id),
                    json!({"toolId": config.tool_id, "inputs": input, "userId": credential.user_id}),
                ),
                continuation: None,
            });
        }

        let invocation = ToolInvocation::new(ToolTarget::arcade(&config.tool_id))
            .with_input(input)
            .with_credential(credential);
        let value = self.invoker.invoke(&invocation).await.map_err(node_error)?;
        debug!(node_id = %ctx.node.id, tool = %config.tool_id, "tool call succeeded");
        Ok(NodeOutcome::Completed(NodeOutput::with_side_effects(value)))
    }
}
