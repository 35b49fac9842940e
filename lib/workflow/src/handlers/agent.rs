//! The `agent` node: a bounded tool-calling loop over an LLM.
//!
//! Declared tools are the only tools the model can reach. Each declaration
//! names where the tool lives (an Arcade tool id or an MCP server) and the
//! calls go through the shared [`ToolInvoker`].

use crate::approval::{ApprovalDecision, ProposedAction};
use crate::error::NodeError;
use crate::handler::{NodeContext, NodeHandler, NodeOutcome, NodeOutput, parse_config};
use crate::interpolate::{INPUT_VAR, stringify};
use crate::node::NodeKind;
use async_trait::async_trait;
use flowrun_ai::{
    AgentCheckpoint, AgentConfig, AgentError, AgentLoop, AgentOutcome, AgentResume, AgentTool,
    LlmBackend, LlmError, MessageRole, ToolCallError, ToolExecutor,
};
use flowrun_integration::{CredentialRef, ToolInvocation, ToolInvocationError, ToolInvoker, ToolTarget};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// How the final answer is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "text", alias = "TEXT")]
    Text,
    #[serde(alias = "json", alias = "JSON")]
    Json,
}

/// A tool the agent may call.
///
/// The location fields sit next to the name, as in
/// `{"type": "arcade", "toolId": "Google.Gmail.ReadEmail", "name": "read_email"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub target: ToolTarget,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// The older `mcpTools` entry shape, folded into [`ToolDeclaration`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpToolEntry {
    name: String,
    #[serde(default)]
    description: String,
    url: String,
    #[serde(default)]
    auth_type: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    parameters: Option<JsonValue>,
    #[serde(default)]
    requires_approval: bool,
}

impl From<McpToolEntry> for ToolDeclaration {
    fn from(entry: McpToolEntry) -> Self {
        Self {
            target: ToolTarget::Mcp {
                url: entry.url,
                tool_name: entry.tool_name.unwrap_or_else(|| entry.name.clone()),
                auth_type: entry.auth_type,
            },
            name: entry.name,
            description: entry.description,
            parameters: entry.parameters,
            requires_approval: entry.requires_approval,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentConfig {
    model: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    tools: Vec<ToolDeclaration>,
    #[serde(default)]
    mcp_tools: Vec<McpToolEntry>,
    #[serde(default)]
    max_iterations: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    output_format: OutputFormat,
    #[serde(default)]
    user_id: Option<String>,
}

/// Configuration of an `agent` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawAgentConfig")]
pub struct AgentNodeConfig {
    pub model: String,
    pub provider: Option<String>,
    pub instructions: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub max_iterations: Option<u32>,
    pub temperature: Option<f32>,
    pub output_format: OutputFormat,
    pub user_id: Option<String>,
}

impl From<RawAgentConfig> for AgentNodeConfig {
    fn from(raw: RawAgentConfig) -> Self {
        let mut tools = raw.tools;
        tools.extend(raw.mcp_tools.into_iter().map(ToolDeclaration::from));
        Self {
            model: raw.model,
            provider: raw.provider,
            instructions: raw.instructions,
            system_prompt: raw.system_prompt,
            prompt: raw.prompt,
            tools,
            max_iterations: raw.max_iterations,
            temperature: raw.temperature,
            output_format: raw.output_format,
            user_id: raw.user_id,
        }
    }
}

fn non_empty(text: Option<&String>) -> Option<&str> {
    text.map(String::as_str).filter(|s| !s.trim().is_empty())
}

impl AgentNodeConfig {
    fn check(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }
        if self.max_iterations == Some(0) {
            return Err("maxIterations must be at least 1".to_string());
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(format!("duplicate tool name '{}'", tool.name));
            }
        }
        Ok(())
    }

    /// Splits the prompts into the system message and the opening user turn.
    ///
    /// The user turn is `prompt`, falling back to `instructions` and then
    /// to the run input's `prompt` field.
    fn messages(&self, input: Option<&JsonValue>) -> Result<(Option<String>, String), NodeError> {
        let prompt = non_empty(self.prompt.as_ref());
        let instructions = non_empty(self.instructions.as_ref());
        let system = non_empty(self.system_prompt.as_ref());

        let user = match (prompt, instructions) {
            (Some(p), _) => p.to_string(),
            (None, Some(i)) => i.to_string(),
            (None, None) => input
                .and_then(|i| i.get("prompt"))
                .map(stringify)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| NodeError::InvalidConfig {
                    reason: "agent has no prompt, instructions or input.prompt".to_string(),
                })?,
        };
        let system = match (system, prompt.and(instructions)) {
            (Some(s), Some(i)) => Some(format!("{s}\n\n{i}")),
            (Some(s), None) => Some(s.to_string()),
            (None, extra) => extra.map(str::to_string),
        };
        Ok((system, user))
    }

    fn agent_config(&self, default_max_iterations: u32, user: String, system: Option<String>) -> AgentConfig {
        let mut config = AgentConfig::new(self.model.clone(), user)
            .with_max_iterations(self.max_iterations.unwrap_or(default_max_iterations));
        if let Some(system) = system {
            config = config.with_system_prompt(system);
        }
        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        for decl in &self.tools {
            let mut tool = AgentTool::new(decl.name.clone(), decl.description.clone());
            if let Some(parameters) = &decl.parameters {
                tool = tool.with_parameters(parameters.clone());
            }
            if decl.requires_approval {
                tool = tool.requiring_approval();
            }
            config = config.with_tool(tool);
        }
        config
    }
}

/// Routes the agent's tool calls to the declared targets.
struct DeclaredTools<'a> {
    invoker: &'a dyn ToolInvoker,
    targets: HashMap<&'a str, &'a ToolTarget>,
    credential: CredentialRef,
}

#[async_trait]
impl ToolExecutor for DeclaredTools<'_> {
    async fn call(&self, tool: &AgentTool, arguments: JsonValue) -> Result<JsonValue, ToolCallError> {
        let target = self
            .targets
            .get(tool.name.as_str())
            .ok_or_else(|| ToolCallError::Failed {
                tool: tool.name.clone(),
                reason: "tool has no declared target".to_string(),
                transient: false,
            })?;
        let invocation = ToolInvocation::new((*target).clone())
            .with_input(arguments)
            .with_credential(self.credential.clone());
        self.invoker.invoke(&invocation).await.map_err(|e| match e {
            ToolInvocationError::AuthRequired {
                authorization_url, ..
            } => ToolCallError::AuthRequired {
                tool: tool.name.clone(),
                authorization_url,
            },
            other => ToolCallError::Failed {
                tool: tool.name.clone(),
                transient: other.is_transient(),
                reason: other.to_string(),
            },
        })
    }
}

fn checkpoint_value(checkpoint: &AgentCheckpoint) -> Option<JsonValue> {
    serde_json::to_value(checkpoint).ok()
}

fn node_error(err: AgentError) -> NodeError {
    match err {
        AgentError::InvalidConfig { reason } => NodeError::InvalidConfig { reason },
        AgentError::Provider { source, checkpoint } if source.is_transient() => {
            let retry_after_secs = match &source {
                LlmError::RateLimited { retry_after_secs } => *retry_after_secs,
                _ => None,
            };
            NodeError::Transient {
                reason: source.to_string(),
                retry_after_secs,
                continuation: checkpoint_value(&checkpoint),
            }
        }
        AgentError::Provider { source, checkpoint } => NodeError::ProviderFailed {
            reason: source.to_string(),
            transcript: checkpoint.transcript,
        },
        AgentError::IterationLimitExceeded { max, transcript } => {
            NodeError::IterationLimitExceeded { max, transcript }
        }
        AgentError::UnknownTool { name, transcript } => NodeError::UnknownTool { name, transcript },
        AgentError::ToolFailed {
            tool,
            reason,
            transient: true,
            checkpoint,
        } => NodeError::Transient {
            reason: format!("tool '{tool}' failed: {reason}"),
            retry_after_secs: None,
            continuation: checkpoint_value(&checkpoint),
        },
        AgentError::ToolFailed {
            tool,
            reason,
            checkpoint,
            ..
        } => NodeError::ToolFailed {
            tool,
            reason,
            transcript: checkpoint.transcript,
        },
        AgentError::AuthRequired {
            tool,
            authorization_url,
            checkpoint,
        } => NodeError::AuthRequired {
            tool,
            authorization_url,
            continuation: checkpoint_value(&checkpoint),
        },
        AgentError::UserRejected { tool, .. } => NodeError::UserRejected {
            reason: format!("call to tool '{tool}' was rejected"),
        },
    }
}

/// Runs an agent loop for each `agent` node.
pub struct AgentHandler {
    backend: Arc<dyn LlmBackend>,
    invoker: Arc<dyn ToolInvoker>,
}

impl AgentHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { backend, invoker }
    }
}

#[async_trait]
impl NodeHandler for AgentHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), String> {
        parse_config::<AgentNodeConfig>(config)?.check()
    }

    fn bounds_own_calls(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, node_id = %ctx.node.id))]
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let config: AgentNodeConfig = ctx.parse_config()?;
        config
            .check()
            .map_err(|reason| NodeError::InvalidConfig { reason })?;
        let (system, user) = config.messages(ctx.variables.get(INPUT_VAR))?;
        let agent = AgentLoop::new(config.agent_config(
            ctx.settings.default_max_iterations,
            user,
            system,
        ))
        .with_call_timeout(ctx.timeout);

        let resume = match ctx.continuation() {
            Some(value) => Some(AgentResume {
                checkpoint: serde_json::from_value(value.clone())
                    .map_err(|e| NodeError::fatal(format!("unreadable agent checkpoint: {e}")))?,
                approved: ctx.approval().map(|d| d == ApprovalDecision::Approved),
            }),
            None => None,
        };

        let executor = DeclaredTools {
            invoker: self.invoker.as_ref(),
            targets: config
                .tools
                .iter()
                .map(|t| (t.name.as_str(), &t.target))
                .collect(),
            credential: config
                .user_id
                .clone()
                .or_else(|| ctx.settings.default_user_id.clone())
                .map(CredentialRef::user)
                .unwrap_or_default(),
        };

        match agent
            .run(self.backend.as_ref(), &executor, resume)
            .await
            .map_err(node_error)?
        {
            AgentOutcome::Finished(run) => {
                debug!(iterations = run.iterations, "agent finished");
                let value = match config.output_format {
                    OutputFormat::Text => JsonValue::String(run.answer.clone()),
                    OutputFormat::Json => serde_json::from_str(run.answer.trim()).map_err(|e| {
                        NodeError::ProviderFailed {
                            reason: format!("answer is not valid JSON: {e}"),
                            transcript: run.transcript.clone(),
                        }
                    })?,
                };
                let called_tools = run.transcript.iter().any(|m| m.role == MessageRole::Tool);
                let output = if called_tools {
                    NodeOutput::with_side_effects(value)
                } else {
                    NodeOutput::pure(value)
                };
                Ok(NodeOutcome::Completed(output.with_metadata(json!({
                    "model": config.model,
                    "provider": config.provider,
                    "iterations": run.iterations,
                    "usage": run.usage,
                    "transcript": run.transcript,
                }))))
            }
            AgentOutcome::ApprovalRequired {
                tool,
                arguments,
                checkpoint,
            } => Ok(NodeOutcome::ApprovalRequired {
                action: ProposedAction::new(
                    format!("agent calls {tool}"),
                    json!({"tool": tool, "arguments": arguments}),
                ),
                continuation: checkpoint_value(&checkpoint),
            }),
        }
    }
}
