//! The `end` node: publishes what reached it as the run output.

use crate::error::NodeError;
use crate::handler::{NodeContext, NodeHandler, NodeOutcome, NodeOutput};
use crate::node::NodeKind;
use async_trait::async_trait;

/// Passes `lastOutput` through.
#[derive(Debug, Default)]
pub struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::End
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::Completed(NodeOutput::pure(
            ctx.last_output().clone(),
        )))
    }
}
