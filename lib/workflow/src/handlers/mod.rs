//! Built-in node handlers.

pub mod agent;
pub mod end;
pub mod http;
pub mod start;
pub mod tool;

pub use agent::{AgentHandler, AgentNodeConfig, OutputFormat, ToolDeclaration};
pub use end::EndHandler;
pub use http::{HttpClient, HttpError, HttpHandler, HttpNodeConfig, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use start::{InputVariable, StartConfig, StartHandler, VariableType};
pub use tool::{ToolHandler, ToolNodeConfig};

use crate::handler::HandlerRegistry;
use flowrun_ai::LlmBackend;
use flowrun_integration::ToolInvoker;
use std::sync::Arc;

impl HandlerRegistry {
    /// Creates a registry with every built-in node type.
    #[must_use]
    pub fn builtin(
        llm: Arc<dyn LlmBackend>,
        tools: Arc<dyn ToolInvoker>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self::new()
            .with(Arc::new(StartHandler))
            .with(Arc::new(EndHandler))
            .with(Arc::new(HttpHandler::new(http)))
            .with(Arc::new(ToolHandler::new(tools.clone())))
            .with(Arc::new(AgentHandler::new(llm, tools)))
    }
}
