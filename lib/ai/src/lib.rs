//! AI primitives for flowrun.
//!
//! - **Backend**: provider-agnostic chat completion with tool calling
//! - **Agent**: bounded multi-turn tool-call loop used by `agent` nodes
//! - **OpenAI-compatible**: reqwest backend for chat-completions APIs

pub mod agent;
pub mod backend;
pub mod error;
pub mod openai;

pub use agent::{
    AgentCheckpoint, AgentConfig, AgentLoop, AgentOutcome, AgentResume, AgentRun, AgentTool,
    DEFAULT_MAX_ITERATIONS, ToolExecutor,
};
pub use backend::{
    ChatMessage, LlmBackend, LlmReply, LlmRequest, LlmResponse, MessageRole, TokenUsage, ToolCall,
    ToolSchema,
};
pub use error::{AgentError, LlmError, ToolCallError};
pub use openai::{OpenAiCompatibleBackend, OpenAiConfig};
