//! Runner configuration.
//!
//! Loaded via the `config` crate from an optional TOML file followed by
//! environment variables prefixed `FLOWRUN`, with `__` separating nested
//! keys (e.g. `FLOWRUN__LLM__API_KEY`, `FLOWRUN__ENGINE__RETRY__MAX_RETRIES`).

use flowrun_ai::OpenAiConfig;
use flowrun_integration::ArcadeConfig;
use flowrun_workflow::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration composed from the library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Root of the file stores: `workflows/`, `runs/` and `approvals/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// OpenAI-compatible provider used by agent nodes.
    #[serde(default)]
    pub llm: OpenAiConfig,

    /// Arcade connection. Arcade tools are unavailable without it.
    #[serde(default)]
    pub arcade: Option<ArcadeConfig>,

    /// MCP transport settings.
    #[serde(default)]
    pub mcp: McpConfig,
}

/// Settings for tools served over MCP.
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    /// Per-call timeout in seconds.
    #[serde(default = "default_mcp_timeout_secs")]
    pub timeout_secs: u64,

    /// Bearer token sent to servers declaring `authType: "bearer"`.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".flowrun")
}

fn default_mcp_timeout_secs() -> u64 {
    30
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_mcp_timeout_secs(),
            bearer_token: None,
        }
    }
}

impl CliConfig {
    /// Loads configuration from `file` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value has the wrong type.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("flowrun").required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("FLOWRUN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Directory holding workflow templates.
    #[must_use]
    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    /// Directory holding run checkpoints.
    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// Directory holding approval requests.
    #[must_use]
    pub fn approvals_dir(&self) -> PathBuf {
        self.data_dir.join("approvals")
    }
}
