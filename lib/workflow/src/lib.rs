//! Workflow engine for flowrun.
//!
//! This crate executes workflows: directed acyclic graphs of typed nodes
//! that pass JSON between each other. It provides:
//!
//! - **Definitions**: nodes, edges and workflow templates as stored JSON
//! - **Validation**: structural checks and topological planning before any run
//! - **Interpolation**: `{{ path }}` placeholders resolved against run variables
//! - **Handlers**: start, end, HTTP, tool and agent node types behind one trait
//! - **Engine**: concurrent scheduling, retries, approvals and checkpointed runs
//! - **Stores**: in-memory and file-backed workflow, run and approval storage

pub mod approval;
pub mod config;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interpolate;
pub mod node;
pub mod remaining_work;
pub mod retry;
pub mod run_state;
pub mod store;
pub mod validate;

pub use approval::{
    ApprovalDecision, ApprovalError, ApprovalRequest, ApprovalService, ApprovalStatus,
    FileApprovals, InMemoryApprovals, ProposedAction,
};
pub use config::EngineConfig;
pub use definition::WorkflowDefinition;
pub use edge::Edge;
pub use engine::{Engine, EngineError};
pub use error::{NodeError, TemplateError, ValidationError};
pub use execution::{NodeExecution, NodeExecutionState, NodeResult, RunStatus};
pub use graph::WorkflowGraph;
pub use handler::{HandlerRegistry, NodeContext, NodeHandler, NodeOutcome, NodeOutput, ResumeState};
pub use node::{Node, NodeKind};
pub use retry::RetryConfig;
pub use run_state::{RunState, Suspension};
pub use store::{
    FileRunStore, FileWorkflowStore, InMemoryRunStore, InMemoryWorkflowStore, RunStore, StoreError,
    WorkflowStore,
};
pub use validate::ExecutionPlan;
