//! `flowrun`: run and manage workflows from the command line.

mod config;
mod error;

use crate::config::CliConfig;
use crate::error::CliError;
use clap::{Parser, Subcommand};
use flowrun_ai::OpenAiCompatibleBackend;
use flowrun_core::{ApprovalRequestId, WorkflowId, WorkflowRunId};
use flowrun_integration::{ArcadeToolInvoker, CompositeToolInvoker, McpToolInvoker};
use flowrun_workflow::handlers::ReqwestHttpClient;
use flowrun_workflow::{
    ApprovalDecision, ApprovalService, Engine, FileApprovals, FileRunStore, FileWorkflowStore,
    HandlerRegistry, RunState, RunStore, WorkflowStore,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = flowrun_core::Result<T, CliError>;

/// Workflow execution engine.
#[derive(Debug, Parser)]
#[command(name = "flowrun", version, about = "Run DAG workflows of agent, tool and HTTP nodes")]
struct Cli {
    /// Configuration file (defaults to `flowrun.toml` when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a stored workflow without running it.
    Validate { workflow: WorkflowId },
    /// List stored workflows.
    Workflows,
    /// Start a run and wait until it finishes or pauses.
    Run {
        workflow: WorkflowId,
        /// Run input as a JSON object.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// File containing the run input.
        #[arg(long)]
        input_file: Option<PathBuf>,
    },
    /// Show the latest checkpoint of a run.
    Status { run: WorkflowRunId },
    /// List runs with checkpoints.
    Runs,
    /// Continue a paused or failed run.
    Resume { run: WorkflowRunId },
    /// Cancel a run.
    Cancel { run: WorkflowRunId },
    /// List approval requests awaiting a decision.
    Approvals,
    /// Approve a proposed action.
    Approve {
        request: ApprovalRequestId,
        /// Resume the run right away.
        #[arg(long)]
        resume: bool,
    },
    /// Reject a proposed action.
    Reject {
        request: ApprovalRequestId,
        /// Resume the run right away.
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,flowrun_workflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(report) = run(cli).await {
        tracing::error!(error = %report, "command failed");
        eprintln!("Error: {report}");
        process::exit(1);
    }
}

/// Everything a command needs.
struct App {
    engine: Engine,
    workflows: Arc<FileWorkflowStore>,
    runs: Arc<FileRunStore>,
    approvals: Arc<FileApprovals>,
}

impl App {
    fn build(config: &CliConfig) -> CliResult<Self> {
        let llm = OpenAiCompatibleBackend::new(config.llm.clone()).map_err(|e| CliError::Setup {
            component: "LLM backend",
            details: e.to_string(),
        })?;

        let mcp = McpToolInvoker::new(
            Duration::from_secs(config.mcp.timeout_secs),
            config.mcp.bearer_token.clone(),
        )
        .map_err(|e| CliError::Setup {
            component: "MCP client",
            details: e.to_string(),
        })?;
        let mut tools = CompositeToolInvoker::new().with(Arc::new(mcp));
        if let Some(arcade) = &config.arcade {
            let arcade = ArcadeToolInvoker::new(arcade.clone()).map_err(|e| CliError::Setup {
                component: "Arcade client",
                details: e.to_string(),
            })?;
            tools = tools.with(Arc::new(arcade));
        }

        let http = ReqwestHttpClient::new(config.engine.node_timeout()).map_err(|e| {
            CliError::Setup {
                component: "HTTP client",
                details: e.to_string(),
            }
        })?;

        let workflows = Arc::new(FileWorkflowStore::new(config.workflows_dir()));
        let runs = Arc::new(FileRunStore::new(config.runs_dir()).map_err(|e| CliError::Setup {
            component: "run store",
            details: e.to_string(),
        })?);
        let approvals = Arc::new(FileApprovals::new(config.approvals_dir()).map_err(|e| {
            CliError::Setup {
                component: "approval store",
                details: e.to_string(),
            }
        })?);

        let registry = HandlerRegistry::builtin(Arc::new(llm), Arc::new(tools), Arc::new(http));
        let engine = Engine::new(
            workflows.clone(),
            runs.clone(),
            approvals.clone(),
            registry,
            config.engine.clone(),
        );
        Ok(Self {
            engine,
            workflows,
            runs,
            approvals,
        })
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = CliConfig::load(cli.config.as_deref()).map_err(|e| CliError::Config {
        details: e.to_string(),
    })?;
    tracing::debug!(data_dir = %config.data_dir.display(), "loaded configuration");
    let app = App::build(&config)?;

    match cli.command {
        Command::Validate { workflow } => {
            let plan = app
                .engine
                .validate_workflow(&workflow)
                .await
                .map_err(CliError::from)?;
            print_json(&serde_json::json!({
                "workflow": workflow,
                "valid": true,
                "order": plan.order(),
            }))
        }
        Command::Workflows => {
            let ids = app.workflows.list_workflows().await.map_err(CliError::from)?;
            print_json(&ids)
        }
        Command::Run {
            workflow,
            input,
            input_file,
        } => {
            let input = read_input(input, input_file).await?;
            let run_id = app
                .engine
                .start_run(&workflow, input)
                .await
                .map_err(CliError::from)?;
            tracing::info!(%run_id, "run started");
            let state = wait_for_run(&app.engine, run_id).await?;
            print_json(&state)
        }
        Command::Status { run } => {
            let state = app.engine.get_run_status(run).await.map_err(CliError::from)?;
            print_json(&state)
        }
        Command::Runs => {
            let ids = app.runs.list_runs().await.map_err(CliError::from)?;
            print_json(&ids)
        }
        Command::Resume { run } => {
            let state = app.engine.resume_run(run).await.map_err(CliError::from)?;
            print_json(&state)
        }
        Command::Cancel { run } => {
            let state = app.engine.cancel_run(run).await.map_err(CliError::from)?;
            print_json(&state)
        }
        Command::Approvals => {
            let pending = app.approvals.pending().await.map_err(CliError::from)?;
            print_json(&pending)
        }
        Command::Approve { request, resume } => {
            decide(&app, request, ApprovalDecision::Approved, resume).await
        }
        Command::Reject { request, resume } => {
            decide(&app, request, ApprovalDecision::Rejected, resume).await
        }
    }
}

async fn decide(
    app: &App,
    request: ApprovalRequestId,
    decision: ApprovalDecision,
    resume: bool,
) -> CliResult<()> {
    let resolved = app
        .approvals
        .resolve(&request, decision)
        .await
        .map_err(CliError::from)?;
    tracing::info!(%request, run_id = %resolved.run_id, ?decision, "approval resolved");
    if !resume {
        return print_json(&resolved);
    }
    let state = app
        .engine
        .resume_run(resolved.run_id)
        .await
        .map_err(CliError::from)?;
    print_json(&state)
}

/// Polls a run until it leaves `pending`/`running`. Ctrl-C cancels it.
async fn wait_for_run(engine: &Engine, run_id: WorkflowRunId) -> CliResult<RunState> {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(%run_id, "interrupted, cancelling run");
                return Ok(engine.cancel_run(run_id).await.map_err(CliError::from)?);
            }
            _ = interval.tick() => {
                let state = engine.get_run_status(run_id).await.map_err(CliError::from)?;
                if state.status.is_terminal() || state.status.is_suspended() {
                    return Ok(state);
                }
            }
        }
    }
}

async fn read_input(input: Option<String>, input_file: Option<PathBuf>) -> CliResult<JsonValue> {
    let raw = match (input, input_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => tokio::fs::read_to_string(&path).await.map_err(|e| {
            CliError::InvalidArgument {
                details: format!("cannot read {}: {e}", path.display()),
            }
        })?,
        (None, None) => return Ok(JsonValue::Null),
    };
    Ok(parse_input(&raw)?)
}

fn parse_input(raw: &str) -> Result<JsonValue, CliError> {
    serde_json::from_str(raw).map_err(|e| CliError::InvalidArgument {
        details: format!("input is not valid JSON: {e}"),
    })
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::Output {
        details: e.to_string(),
    })?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_command_with_inline_input() {
        let cli = Cli::try_parse_from(["flowrun", "run", "greet", "--input", r#"{"name":"Ada"}"#])
            .expect("parse");
        let Command::Run {
            workflow, input, ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(workflow, WorkflowId::from("greet"));
        assert_eq!(input.as_deref(), Some(r#"{"name":"Ada"}"#));
    }

    #[test]
    fn run_ids_are_parsed_with_their_prefix() {
        let id = WorkflowRunId::new();
        let cli = Cli::try_parse_from(["flowrun", "status", &id.to_string()]).expect("parse");
        assert!(matches!(cli.command, Command::Status { run } if run == id));
    }

    #[test]
    fn input_flags_conflict() {
        assert!(
            Cli::try_parse_from([
                "flowrun", "run", "greet", "--input", "{}", "--input-file", "in.json"
            ])
            .is_err()
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            parse_input("{not json"),
            Err(CliError::InvalidArgument { .. })
        ));
        assert_eq!(parse_input(r#"{"a":1}"#).expect("parse")["a"], 1);
    }

    #[tokio::test]
    async fn missing_input_is_null() {
        assert_eq!(read_input(None, None).await.expect("read"), JsonValue::Null);
    }
}
