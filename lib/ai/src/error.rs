//! Error types for the AI crate.
//!
//! - `LlmError`: Low-level LLM backend operations
//! - `ToolCallError`: A tool invoked from inside the agent loop failed
//! - `AgentError`: Agent tool-call loop failures, carrying the transcript
//!   (or a resumable checkpoint) for diagnostics

use crate::agent::AgentCheckpoint;
use crate::backend::ChatMessage;
use std::fmt;

/// Errors from LLM backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Provider is unavailable.
    ProviderUnavailable { provider: String, reason: String },
    /// Request failed.
    RequestFailed { reason: String },
    /// Response parsing failed.
    ResponseParseFailed { reason: String },
    /// Timeout waiting for response.
    Timeout,
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl LlmError {
    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::Timeout | Self::RateLimited { .. }
        )
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable { provider, reason } => {
                write!(f, "LLM provider '{provider}' unavailable: {reason}")
            }
            Self::RequestFailed { reason } => {
                write!(f, "LLM request failed: {reason}")
            }
            Self::ResponseParseFailed { reason } => {
                write!(f, "failed to parse LLM response: {reason}")
            }
            Self::Timeout => write!(f, "LLM request timed out"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid LLM configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for LlmError {}

/// Errors reported by a [`ToolExecutor`](crate::agent::ToolExecutor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    /// The user must authorize the tool out of band first.
    AuthRequired {
        tool: String,
        authorization_url: Option<String>,
    },
    /// The tool call failed.
    Failed {
        tool: String,
        reason: String,
        transient: bool,
    },
}

impl fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRequired { tool, .. } => write!(f, "tool '{tool}' requires authorization"),
            Self::Failed { tool, reason, .. } => write!(f, "tool '{tool}' failed: {reason}"),
        }
    }
}

impl std::error::Error for ToolCallError {}

/// Errors from the agent tool-call loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentError {
    /// The loop configuration is unusable.
    InvalidConfig { reason: String },
    /// The provider call failed. The checkpoint resumes before the failed call.
    Provider {
        source: LlmError,
        checkpoint: AgentCheckpoint,
    },
    /// No final answer within the iteration budget.
    IterationLimitExceeded {
        max: u32,
        transcript: Vec<ChatMessage>,
    },
    /// The model asked for a tool outside the node's declared list.
    UnknownTool {
        name: String,
        transcript: Vec<ChatMessage>,
    },
    /// A tool call failed. The checkpoint re-issues the same call.
    ToolFailed {
        tool: String,
        reason: String,
        transient: bool,
        checkpoint: AgentCheckpoint,
    },
    /// A tool needs out-of-band authorization. The checkpoint re-issues the call.
    AuthRequired {
        tool: String,
        authorization_url: Option<String>,
        checkpoint: AgentCheckpoint,
    },
    /// A human rejected the proposed tool call.
    UserRejected {
        tool: String,
        transcript: Vec<ChatMessage>,
    },
}

impl AgentError {
    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { source, .. } => source.is_transient(),
            Self::ToolFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Returns the checkpoint to resume from, for resumable failures.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&AgentCheckpoint> {
        match self {
            Self::Provider { checkpoint, .. }
            | Self::ToolFailed { checkpoint, .. }
            | Self::AuthRequired { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }

    /// Returns the transcript accumulated before the failure.
    #[must_use]
    pub fn transcript(&self) -> &[ChatMessage] {
        match self {
            Self::InvalidConfig { .. } => &[],
            Self::Provider { checkpoint, .. }
            | Self::ToolFailed { checkpoint, .. }
            | Self::AuthRequired { checkpoint, .. } => &checkpoint.transcript,
            Self::IterationLimitExceeded { transcript, .. }
            | Self::UnknownTool { transcript, .. }
            | Self::UserRejected { transcript, .. } => transcript,
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid agent configuration: {reason}"),
            Self::Provider { source, .. } => write!(f, "{source}"),
            Self::IterationLimitExceeded { max, .. } => {
                write!(f, "no final answer after {max} iterations")
            }
            Self::UnknownTool { name, .. } => {
                write!(f, "model requested undeclared tool '{name}'")
            }
            Self::ToolFailed { tool, reason, .. } => write!(f, "tool '{tool}' failed: {reason}"),
            Self::AuthRequired { tool, .. } => write!(f, "tool '{tool}' requires authorization"),
            Self::UserRejected { tool, .. } => write!(f, "call to tool '{tool}' was rejected"),
        }
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_error_rate_limited() {
        let err = LlmError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert!(err.to_string().contains("30s"));
        assert!(err.is_transient());
    }

    #[test]
    fn request_failures_are_not_transient() {
        let err = LlmError::RequestFailed {
            reason: "400 bad request".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn iteration_limit_keeps_transcript() {
        let err = AgentError::IterationLimitExceeded {
            max: 3,
            transcript: vec![ChatMessage::user("hi")],
        };
        assert!(err.to_string().contains("3 iterations"));
        assert_eq!(err.transcript().len(), 1);
        assert!(err.checkpoint().is_none());
    }
}
