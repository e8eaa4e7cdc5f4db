//! Human approval node executor.
//!
//! Registers a pending approval keyed by `(run_id, node_id)` and suspends
//! until an external caller resolves it, the configured timeout fires, or
//! the run is cancelled. Never retries.

use std::sync::Arc;
use std::time::Duration;

use flowline_types::workflow::{NodeConfig, NodeDefinition, NodeKind};

use crate::workflow::approval::{ApprovalManager, ApprovalResolution};
use crate::workflow::context::RunContext;
use crate::workflow::node_executor::{ExecutionError, NodeExecutor, NodeOutput};

/// Default approval timeout (1 hour).
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;

/// Executes `human` nodes by waiting on the approval table.
pub struct HumanNodeExecutor {
    approvals: Arc<ApprovalManager>,
}

impl HumanNodeExecutor {
    pub fn new(approvals: Arc<ApprovalManager>) -> Self {
        Self { approvals }
    }

    /// The approval table this executor waits on.
    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }
}

impl NodeExecutor for HumanNodeExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Human
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> Result<NodeOutput, ExecutionError> {
        let NodeConfig::Human(cfg) = &node.config else {
            return Err(ExecutionError::Executor(format!(
                "node '{}' is not a human node",
                node.id
            )));
        };

        let rx = self.approvals.register(ctx.run_id, &node.id);
        let timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS));

        tracing::info!(
            run_id = %ctx.run_id,
            node_id = node.id.as_str(),
            timeout_secs = timeout.as_secs(),
            "waiting for approval"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ApprovalResolution::Approved(decision))) => {
                let output = serde_json::to_value(&decision)
                    .map_err(|e| ExecutionError::Executor(e.to_string()))?;
                Ok(NodeOutput::new(output))
            }
            Ok(Ok(ApprovalResolution::Rejected { approver, comment })) => {
                Err(ExecutionError::ApprovalRejected { approver, comment })
            }
            Ok(Ok(ApprovalResolution::Cancelled)) => Err(ExecutionError::ApprovalCancelled),
            // Sender dropped without resolving: the wait was swept away.
            Ok(Err(_)) => Err(ExecutionError::ApprovalCancelled),
            Err(_) => {
                self.approvals.deregister(ctx.run_id, &node.id);
                Err(ExecutionError::ApprovalTimeout)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
