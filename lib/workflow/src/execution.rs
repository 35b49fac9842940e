//! Run and node execution states.

use crate::error::NodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Created, not yet executing.
    Pending,
    /// Actively executing.
    Running,
    /// Paused until a human approves or rejects a proposed action.
    AwaitingApproval,
    /// Paused until the user authorizes a tool out of band.
    AwaitingAuthorization,
    /// An end node was reached.
    Succeeded,
    /// No end node can be reached any more.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is paused on outside input.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::AwaitingAuthorization)
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting-approval",
            Self::AwaitingAuthorization => "awaiting-authorization",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The execution state of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionState {
    /// Not dispatched yet.
    Pending,
    /// Currently executing.
    Running,
    /// Paused on approval or authorization.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Failed.
    Failed,
    /// Not executed because no incoming edge was taken.
    Skipped,
}

/// Execution record for a single node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Current execution state.
    pub state: NodeExecutionState,
    /// Handler calls made so far, across retries and resumes.
    pub attempts: u32,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last error message, if any.
    pub error: Option<String>,
}

impl Default for NodeExecution {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeExecution {
    /// Creates a record in pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: NodeExecutionState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Marks the node as running.
    pub fn start(&mut self) {
        self.state = NodeExecutionState::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.finished_at = None;
    }

    /// Adds handler calls to the attempt counter.
    pub fn record_attempts(&mut self, attempts: u32) {
        self.attempts += attempts;
    }

    /// Marks the node as completed.
    pub fn complete(&mut self) {
        self.state = NodeExecutionState::Completed;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = NodeExecutionState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Marks the node as paused.
    pub fn suspend(&mut self, reason: impl Into<String>) {
        self.state = NodeExecutionState::Suspended;
        self.error = Some(reason.into());
    }

    /// Marks the node as skipped.
    pub fn skip(&mut self) {
        self.state = NodeExecutionState::Skipped;
        self.finished_at = Some(Utc::now());
    }
}

/// The recorded outcome of a node. A node has at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeResult {
    /// The node produced an output.
    Succeeded {
        output: JsonValue,
        side_effects_performed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<JsonValue>,
    },
    /// The node failed.
    Failed { error: NodeError },
    /// The node was not executed.
    Skipped,
}

impl NodeResult {
    /// Returns the output of a succeeded node.
    #[must_use]
    pub fn output(&self) -> Option<&JsonValue> {
        match self {
            Self::Succeeded { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Returns the error of a failed node.
    #[must_use]
    pub fn error(&self) -> Option<&NodeError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}
