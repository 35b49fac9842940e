//! Tool invocation trait and related types.
//!
//! Every external tool provider implements [`ToolInvoker`], giving the engine
//! one uniform way to call OAuth-backed actions.

use crate::error::ToolInvocationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Where a tool lives and how to address it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolTarget {
    /// A tool hosted by Arcade, addressed by its qualified id
    /// (e.g. `Google.Gmail.SendEmail`).
    Arcade {
        #[serde(rename = "toolId")]
        tool_id: String,
    },
    /// A tool exposed by an MCP server over HTTP.
    Mcp {
        url: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "authType", default)]
        auth_type: Option<String>,
    },
}

impl ToolTarget {
    /// Creates an Arcade target.
    #[must_use]
    pub fn arcade(tool_id: impl Into<String>) -> Self {
        Self::Arcade {
            tool_id: tool_id.into(),
        }
    }

    /// Returns a short label for logs and errors.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Arcade { tool_id } => tool_id.clone(),
            Self::Mcp { url, tool_name, .. } => format!("{tool_name}@{url}"),
        }
    }
}

/// Handle to the credentials a tool should act with.
///
/// The engine only passes this reference through; the tool provider owns
/// the actual tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredentialRef {
    /// The end user on whose behalf the tool acts.
    pub user_id: Option<String>,
}

impl CredentialRef {
    /// Creates a credential reference for a user.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

/// A single tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// The tool to call.
    pub target: ToolTarget,
    /// Input arguments.
    pub input: JsonValue,
    /// Credentials to act with.
    pub credential: CredentialRef,
}

impl ToolInvocation {
    /// Creates a new invocation with empty input and no credential.
    #[must_use]
    pub fn new(target: ToolTarget) -> Self {
        Self {
            target,
            input: JsonValue::Object(Default::default()),
            credential: CredentialRef::default(),
        }
    }

    /// Sets the input arguments.
    #[must_use]
    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = input;
        self
    }

    /// Sets the credential reference.
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = credential;
        self
    }
}

/// Trait for external tool providers.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invokes a tool and returns its structured result.
    ///
    /// # Errors
    ///
    /// Returns [`ToolInvocationError::AuthRequired`] when the user must
    /// authorize the tool first, or another variant when the call fails.
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<JsonValue, ToolInvocationError>;

    /// Returns true if this invoker can serve the given target.
    fn supports(&self, target: &ToolTarget) -> bool;
}

/// Dispatches each invocation to the first invoker that supports its target.
#[derive(Clone, Default)]
pub struct CompositeToolInvoker {
    invokers: Vec<Arc<dyn ToolInvoker>>,
}

impl CompositeToolInvoker {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an invoker.
    #[must_use]
    pub fn with(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invokers.push(invoker);
        self
    }
}

#[async_trait]
impl ToolInvoker for CompositeToolInvoker {
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<JsonValue, ToolInvocationError> {
        let invoker = self
            .invokers
            .iter()
            .find(|i| i.supports(&invocation.target))
            .ok_or_else(|| ToolInvocationError::Unsupported {
                target: invocation.target.label(),
            })?;
        invoker.invoke(invocation).await
    }

    fn supports(&self, target: &ToolTarget) -> bool {
        self.invokers.iter().any(|i| i.supports(target))
    }
}
