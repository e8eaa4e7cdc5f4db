//! Pending human approvals.
//!
//! The human node executor suspends on an entry in this table, keyed by
//! `"{run_id}:{node_id}"`, until an external caller approves or rejects it,
//! the configured timeout fires, or the run is cancelled. Built on the same
//! correlation table as the protocol client's RPC waits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::pending::PendingMap;

/// How a pending approval was resolved.
#[derive(Debug, Clone)]
pub enum ApprovalResolution {
    /// An approver accepted.
    Approved(ApprovalDecision),
    /// An approver declined.
    Rejected { approver: String, comment: String },
    /// The run was cancelled while the approval was pending.
    Cancelled,
}

/// The recorded outcome of an accepted approval; becomes the node output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "approvedAt")]
    pub approved_at: DateTime<Utc>,
}

/// Table of approvals waiting for an external decision.
///
/// Owned by the human node executor; the workflow executor holds a handle
/// so `cancel()` can sweep a run's pending approvals.
pub struct ApprovalManager {
    pending: PendingMap<String, ApprovalResolution>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self {
            pending: PendingMap::new(),
        }
    }

    /// The correlation key for one `(run, node)` approval.
    pub fn key(run_id: Uuid, node_id: &str) -> String {
        format!("{run_id}:{node_id}")
    }

    /// Register a pending approval and return the wait handle.
    pub fn register(&self, run_id: Uuid, node_id: &str) -> oneshot::Receiver<ApprovalResolution> {
        self.pending.register(Self::key(run_id, node_id))
    }

    /// Deregister a wait that gave up (timeout path).
    pub fn deregister(&self, run_id: Uuid, node_id: &str) {
        self.pending.remove(&Self::key(run_id, node_id));
    }

    /// Approve a pending node. Returns `false` when nothing is waiting.
    pub fn approve(
        &self,
        run_id: Uuid,
        node_id: &str,
        approver: impl Into<String>,
        comment: Option<String>,
    ) -> bool {
        let decision = ApprovalDecision {
            approved: true,
            approver: approver.into(),
            comment,
            approved_at: Utc::now(),
        };
        self.pending.resolve(
            &Self::key(run_id, node_id),
            ApprovalResolution::Approved(decision),
        )
    }

    /// Reject a pending node. Returns `false` when nothing is waiting.
    pub fn reject(
        &self,
        run_id: Uuid,
        node_id: &str,
        approver: impl Into<String>,
        comment: impl Into<String>,
    ) -> bool {
        self.pending.resolve(
            &Self::key(run_id, node_id),
            ApprovalResolution::Rejected {
                approver: approver.into(),
                comment: comment.into(),
            },
        )
    }

    /// Cancel every pending approval belonging to a run. Returns how many
    /// waits were cancelled.
    pub fn cancel_run(&self, run_id: Uuid) -> usize {
        let prefix = format!("{run_id}:");
        let keys: Vec<String> = self
            .pending
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if self.pending.resolve(&key, ApprovalResolution::Cancelled) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Snapshot of all pending approval keys (`"{run_id}:{node_id}"`).
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.keys()
    }
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
