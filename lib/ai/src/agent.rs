//! Agent tool-call loop.
//!
//! A bounded ReAct-style loop where the model:
//! 1. Reads the running transcript
//! 2. Either answers, or asks for one of its declared tools
//! 3. Sees the tool result appended to the transcript
//! 4. Repeats until it answers or `max_iterations` provider round trips pass
//!
//! The loop can pause (a tool needs human approval or out-of-band
//! authorization) and pick up again from an [`AgentCheckpoint`] without
//! repeating provider calls or tool calls that already happened. A call
//! timeout bounds each provider and tool call separately, so a slow call
//! fails with a checkpoint taken just before it.

use crate::backend::{ChatMessage, LlmBackend, LlmReply, LlmRequest, LlmResponse, TokenUsage, ToolCall, ToolSchema};
use crate::error::{AgentError, LlmError, ToolCallError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Iteration budget used when a node does not set one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// A tool the agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTool {
    /// Name the model uses to call the tool.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: JsonValue,
    /// Calls to this tool need human approval before they run.
    pub requires_approval: bool,
}

impl AgentTool {
    /// Creates a tool that accepts any object.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object"}),
            requires_approval: false,
        }
    }

    /// Sets the argument schema.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Marks calls to this tool as needing approval.
    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Configuration for one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier, passed through to the provider.
    pub model: String,
    /// System prompt.
    pub system_prompt: Option<String>,
    /// The user turn that opens the conversation.
    pub prompt: String,
    /// Tools the agent may call. Nothing else is callable.
    pub tools: Vec<AgentTool>,
    /// Maximum provider round trips.
    pub max_iterations: u32,
    /// Temperature, passed through to the provider.
    pub temperature: Option<f32>,
}

impl AgentConfig {
    /// Creates a configuration with the default iteration budget.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            prompt: prompt.into(),
            tools: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: None,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Adds a callable tool.
    #[must_use]
    pub fn with_tool(mut self, tool: AgentTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Sets the maximum iterations.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Checks the configuration is runnable.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero iteration budget or duplicate tool names.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_iterations == 0 {
            return Err(AgentError::InvalidConfig {
                reason: "maxIterations must be at least 1".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(AgentError::InvalidConfig {
                    reason: format!("duplicate tool name '{}'", tool.name),
                });
            }
        }
        Ok(())
    }

    fn tool(&self, name: &str) -> Option<&AgentTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn opening_transcript(&self) -> Vec<ChatMessage> {
        let mut transcript = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            transcript.push(ChatMessage::system(system.clone()));
        }
        transcript.push(ChatMessage::user(self.prompt.clone()));
        transcript
    }
}

/// Resumable state of a paused or failed loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    /// Transcript so far.
    pub transcript: Vec<ChatMessage>,
    /// Provider round trips already spent.
    pub iterations: u32,
    /// A tool call the model requested that has not run yet.
    pub pending_call: Option<ToolCall>,
    /// The pending call was already approved by a human.
    #[serde(default)]
    pub pending_approved: bool,
}

/// How to continue a previous run.
#[derive(Debug, Clone)]
pub struct AgentResume {
    /// Where the loop stopped.
    pub checkpoint: AgentCheckpoint,
    /// Human decision on the pending call, if one was asked for.
    pub approved: Option<bool>,
}

/// A completed agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    /// The model's final answer.
    pub answer: String,
    /// Full transcript, ending with the answer.
    pub transcript: Vec<ChatMessage>,
    /// Provider round trips used.
    pub iterations: u32,
    /// Token usage summed over this invocation.
    pub usage: TokenUsage,
    /// When this invocation started.
    pub started_at: DateTime<Utc>,
    /// When the answer arrived.
    pub finished_at: DateTime<Utc>,
}

/// Result of driving the loop.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// The model produced a final answer.
    Finished(AgentRun),
    /// The model asked for a tool that needs approval before it runs.
    ApprovalRequired {
        /// The tool being called.
        tool: String,
        /// Arguments the model supplied.
        arguments: JsonValue,
        /// State to resume from once a decision exists.
        checkpoint: AgentCheckpoint,
    },
}

/// Runs the tools an agent calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Calls `tool` with the model-supplied arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or needs authorization.
    async fn call(&self, tool: &AgentTool, arguments: JsonValue) -> Result<JsonValue, ToolCallError>;
}

/// Drives the bounded tool-call loop for one configuration.
#[derive(Debug, Clone)]
pub struct AgentLoop {
    config: AgentConfig,
    call_timeout: Option<Duration>,
}

impl AgentLoop {
    /// Creates a loop for the given configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            call_timeout: None,
        }
    }

    /// Bounds every provider call and tool call by `timeout`.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    async fn complete(&self, backend: &dyn LlmBackend, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, backend.complete(request))
                .await
                .unwrap_or(Err(LlmError::Timeout)),
            None => backend.complete(request).await,
        }
    }

    async fn call_tool(
        &self,
        executor: &dyn ToolExecutor,
        tool: &AgentTool,
        arguments: JsonValue,
    ) -> Result<JsonValue, ToolCallError> {
        let Some(limit) = self.call_timeout else {
            return executor.call(tool, arguments).await;
        };
        tokio::time::timeout(limit, executor.call(tool, arguments))
            .await
            .unwrap_or_else(|_| {
                Err(ToolCallError::Failed {
                    tool: tool.name.clone(),
                    reason: format!("timed out after {}ms", limit.as_millis()),
                    transient: true,
                })
            })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs the loop, optionally continuing from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] when the loop cannot reach a final answer.
    #[instrument(skip_all, fields(model = %self.config.model, max_iterations = self.config.max_iterations))]
    pub async fn run(
        &self,
        backend: &dyn LlmBackend,
        executor: &dyn ToolExecutor,
        resume: Option<AgentResume>,
    ) -> Result<AgentOutcome, AgentError> {
        self.config.validate()?;

        let started_at = Utc::now();
        let mut usage = TokenUsage::default();
        let (mut transcript, mut iterations, mut pending, mut approved) = match resume {
            Some(AgentResume {
                checkpoint,
                approved: decision,
            }) => {
                let approved = checkpoint.pending_call.is_some()
                    && (checkpoint.pending_approved || decision == Some(true));
                if decision == Some(false)
                    && let Some(call) = &checkpoint.pending_call
                {
                    return Err(AgentError::UserRejected {
                        tool: call.name.clone(),
                        transcript: checkpoint.transcript,
                    });
                }
                (
                    checkpoint.transcript,
                    checkpoint.iterations,
                    checkpoint.pending_call,
                    approved,
                )
            }
            None => (self.config.opening_transcript(), 0, None, false),
        };

        loop {
            if let Some(call) = pending.take() {
                let Some(tool) = self.config.tool(&call.name) else {
                    return Err(AgentError::UnknownTool {
                        name: call.name,
                        transcript,
                    });
                };

                if tool.requires_approval && !approved {
                    debug!(tool = %tool.name, "tool call needs approval");
                    return Ok(AgentOutcome::ApprovalRequired {
                        tool: tool.name.clone(),
                        arguments: call.arguments.clone(),
                        checkpoint: AgentCheckpoint {
                            transcript,
                            iterations,
                            pending_call: Some(call),
                            pending_approved: false,
                        },
                    });
                }

                match self.call_tool(executor, tool, call.arguments.clone()).await {
                    Ok(result) => {
                        debug!(tool = %tool.name, "tool call succeeded");
                        transcript.push(ChatMessage::tool_result(call.id.clone(), &result));
                    }
                    Err(ToolCallError::AuthRequired {
                        tool: tool_name,
                        authorization_url,
                    }) => {
                        return Err(AgentError::AuthRequired {
                            tool: tool_name,
                            authorization_url,
                            checkpoint: AgentCheckpoint {
                                transcript,
                                iterations,
                                pending_call: Some(call),
                                pending_approved: approved,
                            },
                        });
                    }
                    Err(ToolCallError::Failed {
                        tool: tool_name,
                        reason,
                        transient,
                    }) => {
                        warn!(tool = %tool_name, %reason, transient, "tool call failed");
                        return Err(AgentError::ToolFailed {
                            tool: tool_name,
                            reason,
                            transient,
                            checkpoint: AgentCheckpoint {
                                transcript,
                                iterations,
                                pending_call: Some(call),
                                pending_approved: approved,
                            },
                        });
                    }
                }
                approved = false;
            }

            if iterations >= self.config.max_iterations {
                return Err(AgentError::IterationLimitExceeded {
                    max: self.config.max_iterations,
                    transcript,
                });
            }

            let request = LlmRequest::new(self.config.model.clone(), transcript.clone())
                .with_tools(self.config.tools.iter().map(AgentTool::schema).collect())
                .with_temperature(self.config.temperature);
            let response = match self.complete(backend, &request).await {
                Ok(response) => response,
                Err(source) => {
                    return Err(AgentError::Provider {
                        source,
                        checkpoint: AgentCheckpoint {
                            transcript,
                            iterations,
                            pending_call: None,
                            pending_approved: false,
                        },
                    });
                }
            };
            iterations += 1;
            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;
            debug!(iteration = iterations, provider = backend.provider(), "provider round trip");

            match response.reply {
                LlmReply::Text { text } => {
                    transcript.push(ChatMessage::assistant(text.clone()));
                    return Ok(AgentOutcome::Finished(AgentRun {
                        answer: text,
                        transcript,
                        iterations,
                        usage,
                        started_at,
                        finished_at: Utc::now(),
                    }));
                }
                LlmReply::ToolCall { call } => {
                    transcript.push(ChatMessage::assistant_tool_call(call.clone()));
                    if self.config.tool(&call.name).is_none() {
                        warn!(tool = %call.name, "model requested undeclared tool");
                        return Err(AgentError::UnknownTool {
                            name: call.name,
                            transcript,
                        });
                    }
                    if iterations >= self.config.max_iterations {
                        return Err(AgentError::IterationLimitExceeded {
                            max: self.config.max_iterations,
                            transcript,
                        });
                    }
                    pending = Some(call);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MessageRole;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that replays scripted replies, then repeats the last one.
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<LlmReply, LlmError>>>,
        fallback: LlmReply,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<LlmReply, LlmError>>, fallback: LlmReply) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front();
            let reply = match next {
                Some(reply) => reply?,
                None => self.fallback.clone(),
            };
            Ok(LlmResponse {
                reply,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                model: request.model.clone(),
            })
        }

        fn provider(&self) -> &str {
            "scripted"
        }
    }

    /// Executor that records calls and answers with a fixed value.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, JsonValue)>>,
        fail_with: Option<ToolCallError>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn call(&self, tool: &AgentTool, arguments: JsonValue) -> Result<JsonValue, ToolCallError> {
            self.calls.lock().unwrap().push((tool.name.clone(), arguments));
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(serde_json::json!({"ok": true})),
            }
        }
    }

    fn tool_call(name: &str) -> LlmReply {
        LlmReply::ToolCall {
            call: ToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments: serde_json::json!({"q": "x"}),
            },
        }
    }

    fn text(answer: &str) -> LlmReply {
        LlmReply::Text {
            text: answer.to_string(),
        }
    }

    #[tokio::test]
    async fn answers_without_tools() {
        let backend = ScriptedBackend::new(vec![Ok(text("42"))], text("unused"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(AgentConfig::new("m", "question").with_system_prompt("be brief"));

        let outcome = agent.run(&backend, &executor, None).await.expect("run");
        let AgentOutcome::Finished(run) = outcome else {
            panic!("expected a final answer");
        };
        assert_eq!(run.answer, "42");
        assert_eq!(run.iterations, 1);
        assert_eq!(run.transcript.len(), 3);
        assert_eq!(run.usage.total(), 15);
    }

    #[tokio::test]
    async fn calls_tool_then_answers() {
        let backend = ScriptedBackend::new(vec![Ok(tool_call("search")), Ok(text("found"))], text("unused"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(AgentConfig::new("m", "find it").with_tool(AgentTool::new("search", "s")));

        let outcome = agent.run(&backend, &executor, None).await.expect("run");
        let AgentOutcome::Finished(run) = outcome else {
            panic!("expected a final answer");
        };
        assert_eq!(run.answer, "found");
        assert_eq!(run.iterations, 2);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn iteration_limit_stops_after_exactly_max_round_trips() {
        let backend = ScriptedBackend::new(vec![], tool_call("search"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(
            AgentConfig::new("m", "loop forever")
                .with_tool(AgentTool::new("search", "s"))
                .with_max_iterations(3),
        );

        let err = agent.run(&backend, &executor, None).await.unwrap_err();
        assert!(matches!(err, AgentError::IterationLimitExceeded { max: 3, .. }));
        assert_eq!(backend.calls(), 3);
        assert!(!err.transcript().is_empty());
    }

    #[tokio::test]
    async fn undeclared_tool_is_rejected() {
        let backend = ScriptedBackend::new(vec![Ok(tool_call("delete_everything"))], text("unused"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(AgentConfig::new("m", "p").with_tool(AgentTool::new("search", "s")));

        let err = agent.run(&backend, &executor, None).await.unwrap_err();
        match err {
            AgentError::UnknownTool { name, transcript } => {
                assert_eq!(name, "delete_everything");
                assert_eq!(transcript.len(), 2);
            }
            other => panic!("expected UnknownTool, got {other:?}"),
        }
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn approval_pauses_and_resume_runs_the_call() {
        let backend = ScriptedBackend::new(vec![Ok(tool_call("send_email")), Ok(text("sent"))], text("unused"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(
            AgentConfig::new("m", "email bob").with_tool(AgentTool::new("send_email", "s").requiring_approval()),
        );

        let outcome = agent.run(&backend, &executor, None).await.expect("run");
        let AgentOutcome::ApprovalRequired { tool, checkpoint, .. } = outcome else {
            panic!("expected approval request");
        };
        assert_eq!(tool, "send_email");
        assert!(executor.calls.lock().unwrap().is_empty());

        let resumed = agent
            .run(
                &backend,
                &executor,
                Some(AgentResume {
                    checkpoint,
                    approved: Some(true),
                }),
            )
            .await
            .expect("resume");
        let AgentOutcome::Finished(run) = resumed else {
            panic!("expected a final answer");
        };
        assert_eq!(run.answer, "sent");
        assert_eq!(run.iterations, 2);
        assert_eq!(backend.calls(), 2);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejection_fails_with_user_rejected() {
        let backend = ScriptedBackend::new(vec![Ok(tool_call("send_email"))], text("unused"));
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(
            AgentConfig::new("m", "email bob").with_tool(AgentTool::new("send_email", "s").requiring_approval()),
        );

        let AgentOutcome::ApprovalRequired { checkpoint, .. } =
            agent.run(&backend, &executor, None).await.expect("run")
        else {
            panic!("expected approval request");
        };
        let err = agent
            .run(
                &backend,
                &executor,
                Some(AgentResume {
                    checkpoint,
                    approved: Some(false),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UserRejected { .. }));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auth_required_carries_resumable_checkpoint() {
        let backend = ScriptedBackend::new(vec![Ok(tool_call("read_email"))], text("unused"));
        let executor = RecordingExecutor {
            fail_with: Some(ToolCallError::AuthRequired {
                tool: "read_email".to_string(),
                authorization_url: Some("https://auth".to_string()),
            }),
            ..Default::default()
        };
        let agent = AgentLoop::new(AgentConfig::new("m", "p").with_tool(AgentTool::new("read_email", "r")));

        let err = agent.run(&backend, &executor, None).await.unwrap_err();
        let checkpoint = err.checkpoint().cloned().expect("checkpoint");
        assert_eq!(checkpoint.iterations, 1);
        assert_eq!(
            checkpoint.pending_call.as_ref().map(|c| c.name.as_str()),
            Some("read_email")
        );
    }

    #[tokio::test]
    async fn provider_errors_keep_the_transcript() {
        let backend = ScriptedBackend::new(
            vec![Err(LlmError::RateLimited {
                retry_after_secs: None,
            })],
            text("unused"),
        );
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(AgentConfig::new("m", "p"));

        let err = agent.run(&backend, &executor, None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.checkpoint().map(|c| c.iterations), Some(0));
    }

    /// Asks for `search`, then stalls once before answering.
    struct StallsAfterTool {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmBackend for StallsAfterTool {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = match n {
                0 => tool_call("search"),
                1 => {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    text("late")
                }
                _ => text("found"),
            };
            Ok(LlmResponse {
                reply,
                usage: TokenUsage::default(),
                model: request.model.clone(),
            })
        }

        fn provider(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn slow_provider_call_times_out_after_completed_tool_calls() {
        let backend = StallsAfterTool {
            calls: AtomicU32::new(0),
        };
        let executor = RecordingExecutor::default();
        let agent = AgentLoop::new(AgentConfig::new("m", "find it").with_tool(AgentTool::new("search", "s")))
            .with_call_timeout(std::time::Duration::from_millis(50));

        let err = agent.run(&backend, &executor, None).await.unwrap_err();
        let AgentError::Provider { source, checkpoint } = err else {
            panic!("expected provider timeout, got {err:?}");
        };
        assert_eq!(source, LlmError::Timeout);
        assert_eq!(checkpoint.iterations, 1);
        assert!(checkpoint.pending_call.is_none());
        assert_eq!(checkpoint.transcript.last().map(|m| m.role), Some(MessageRole::Tool));

        let outcome = agent
            .run(
                &backend,
                &executor,
                Some(AgentResume {
                    checkpoint,
                    approved: None,
                }),
            )
            .await
            .expect("resume");
        let AgentOutcome::Finished(run) = outcome else {
            panic!("expected a final answer");
        };
        assert_eq!(run.answer, "found");
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let config = AgentConfig::new("m", "p").with_max_iterations(0);
        assert!(matches!(config.validate(), Err(AgentError::InvalidConfig { .. })));
    }

    #[test]
    fn duplicate_tool_names_are_invalid() {
        let config = AgentConfig::new("m", "p")
            .with_tool(AgentTool::new("a", "1"))
            .with_tool(AgentTool::new("a", "2"));
        assert!(config.validate().is_err());
    }
}
