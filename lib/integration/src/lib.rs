//! External tool capability for flowrun.
//!
//! The engine never performs an OAuth dance itself. It asks a [`ToolInvoker`]
//! to "call this tool with this input on behalf of this user" and surfaces a
//! distinct [`ToolInvocationError::AuthRequired`] when the user still has to
//! authorize the tool out of band.
//!
//! - **Tool trait**: [`ToolInvoker`], [`ToolInvocation`], [`ToolTarget`]
//! - **Arcade**: [`ArcadeToolInvoker`] for Arcade-hosted OAuth tools
//! - **MCP**: [`McpToolInvoker`] for tools served over MCP's HTTP transport

pub mod arcade;
pub mod error;
pub mod mcp;
pub mod tool;

pub use arcade::{ArcadeConfig, ArcadeToolInvoker};
pub use error::ToolInvocationError;
pub use mcp::McpToolInvoker;
pub use tool::{CompositeToolInvoker, CredentialRef, ToolInvocation, ToolInvoker, ToolTarget};
