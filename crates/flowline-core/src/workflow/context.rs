//! Per-run execution context.
//!
//! `RunContext` is the in-memory state of one run: the input variables it
//! was seeded with and the outputs of every completed node. It is the sole
//! source for `${...}` template resolution, is owned by the workflow
//! executor for the duration of the run, and is dropped when the run
//! reaches a terminal status.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use flowline_types::workflow::{Run, RunNode, RunNodeStatus};

/// In-memory execution state of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run this context belongs to.
    pub run_id: Uuid,
    /// Tenant that owns the run.
    pub tenant_id: String,
    /// Input variables (seeded from the run's input map and workflow vars).
    pub variables: HashMap<String, Value>,
    /// Outputs of completed nodes, keyed by node ID. Written only by the
    /// scheduler, on the completion path of each node.
    pub outputs: HashMap<String, Value>,
}

impl RunContext {
    /// Create a fresh context for a run.
    pub fn new(run_id: Uuid, tenant_id: impl Into<String>, variables: HashMap<String, Value>) -> Self {
        Self {
            run_id,
            tenant_id: tenant_id.into(),
            variables,
            outputs: HashMap::new(),
        }
    }

    /// Rebuild a context from persisted state, for resume-from-checkpoint.
    ///
    /// Seeds variables from the run's inputs and outputs from every
    /// completed node record. Returns the context together with the set of
    /// completed node IDs to hand to
    /// [`WorkflowExecutor::resume`](super::executor::WorkflowExecutor::resume).
    pub fn restore(run: &Run, nodes: &[RunNode]) -> (Self, Vec<String>) {
        let mut ctx = Self::new(run.id, run.tenant_id.clone(), run.inputs.clone());
        let mut completed = Vec::new();
        for node in nodes {
            if node.status == RunNodeStatus::Completed {
                if let Some(output) = &node.output {
                    ctx.outputs.insert(node.node_id.clone(), output.clone());
                }
                completed.push(node.node_id.clone());
            }
        }
        (ctx, completed)
    }

    /// Record the output of a completed node.
    pub fn set_output(&mut self, node_id: impl Into<String>, output: Value) {
        self.outputs.insert(node_id.into(), output);
    }

    /// Get the output of a completed node.
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }
}
