//! Execution events emitted on the run event bus.
//!
//! `ExecutionEvent` is the unified event type broadcast while a run executes.
//! All variants are Clone + Send + Sync for use with tokio broadcast
//! channels, and serialize with a snake_case `type` tag for SSE streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event observed during one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: ExecutionEventKind,
}

impl ExecutionEvent {
    /// Create an event stamped with the current time.
    pub fn now(run_id: Uuid, kind: ExecutionEventKind) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The node this event concerns, when it is node-scoped.
    pub fn node_id(&self) -> Option<&str> {
        match &self.kind {
            ExecutionEventKind::NodeStarted { node_id }
            | ExecutionEventKind::NodeCompleted { node_id, .. }
            | ExecutionEventKind::NodeFailed { node_id, .. }
            | ExecutionEventKind::WaitingApproval { node_id, .. } => Some(node_id),
            ExecutionEventKind::WorkflowCompleted
            | ExecutionEventKind::WorkflowFailed { .. } => None,
        }
    }
}

/// The kinds of execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEventKind {
    /// A node has started executing.
    NodeStarted { node_id: String },

    /// A node completed successfully with its output.
    NodeCompleted { node_id: String, output: Value },

    /// A node failed after exhausting its retries.
    NodeFailed { node_id: String, error: String },

    /// A human node is suspended waiting for approval. The payload carries
    /// the node's approval configuration (prompt, approvers, timeout).
    WaitingApproval { node_id: String, payload: Value },

    /// Every node completed and the run finished.
    WorkflowCompleted,

    /// The run terminated without completing all nodes.
    WorkflowFailed { error: String },
}
