//! Core types shared by the flowrun crates.
//!
//! This crate holds the strongly-typed identifiers used across the engine and
//! the rootcause-based `Result` alias used at the outer layers.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ApprovalRequestId, EdgeId, NodeId, ParseIdError, WorkflowId, WorkflowRunId};
