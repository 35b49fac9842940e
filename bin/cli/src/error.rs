//! Error type for the command-line runner.
//!
//! Library errors are converted into [`CliError`] and wrapped in a rootcause
//! `Report` at the command boundary.

use flowrun_workflow::{ApprovalError, EngineError, StoreError};
use std::fmt;

/// Errors surfaced to the user by the `flowrun` binary.
#[derive(Debug)]
pub enum CliError {
    /// Configuration could not be loaded.
    Config { details: String },
    /// A backend client or store could not be set up.
    Setup { component: &'static str, details: String },
    /// A command argument is unusable.
    InvalidArgument { details: String },
    /// The engine rejected the operation.
    Engine(EngineError),
    /// The approval service failed.
    Approval(ApprovalError),
    /// Storage failed outside an engine operation.
    Store(StoreError),
    /// A result could not be written.
    Output { details: String },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::Setup { component, details } => {
                write!(f, "failed to set up {component}: {details}")
            }
            Self::InvalidArgument { details } => write!(f, "invalid argument: {details}"),
            Self::Engine(e) => write!(f, "{e}"),
            Self::Approval(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Output { details } => write!(f, "failed to write output: {details}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ApprovalError> for CliError {
    fn from(e: ApprovalError) -> Self {
        Self::Approval(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::WorkflowId;

    #[test]
    fn engine_errors_display_unchanged() {
        let err = CliError::from(EngineError::WorkflowNotFound {
            workflow_id: WorkflowId::from("greet"),
        });
        assert_eq!(err.to_string(), "workflow not found: greet");
    }

    #[test]
    fn setup_errors_name_the_component() {
        let err = CliError::Setup {
            component: "run store",
            details: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("run store"));
    }
}
