//! The workflow scheduling loop.
//!
//! `WorkflowExecutor` drives one run at a time: it validates the workflow,
//! dispatches runnable nodes as concurrent tasks under the concurrency
//! bound, records outputs in the run context, persists node-state deltas
//! through the repository (best-effort), and emits execution events on the
//! broadcast bus.
//!
//! # Scheduling
//!
//! The loop alternates between two steps: dispatch every runnable node for
//! which capacity exists, then wait for the next completion outcome on a
//! channel (no polling sleeps). All set mutation, context writes, event
//! emission, and persistence happen on the scheduler's task; node tasks
//! only execute and report.
//!
//! A run with no runnable candidates and nothing in flight while unfinished
//! nodes remain is stuck (a dependency failed) and terminates as failed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use flowline_types::event::{ExecutionEvent, ExecutionEventKind};
use flowline_types::workflow::{
    NodeConfig, NodeDefinition, NodeKind, RunNodeStatus, RunNodeUpdate, RunStatus, Workflow,
};

use crate::event::EventBus;
use crate::repository::RunRepository;

use super::approval::ApprovalManager;
use super::context::RunContext;
use super::dag::{self, ValidationError};
use super::node_executor::{ExecutionError, NodeExecutorRegistry, NodeOutput};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default bound on concurrently executing nodes.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default per-attempt node timeout (5 minutes).
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 300;

/// Tunables for the scheduling loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of nodes simultaneously in flight.
    pub max_concurrent: usize,
    /// Per-attempt timeout applied to every node except human approvals,
    /// which own their approval timeout.
    pub node_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            node_timeout: Duration::from_secs(DEFAULT_NODE_TIMEOUT_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// The outcome of a completed (or cancelled) run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// Terminal run status. `Cancelled` suppresses the completion event.
    pub status: RunStatus,
    /// The final context, with every completed node's output.
    pub context: RunContext,
    /// IDs of nodes that completed.
    pub completed: Vec<String>,
    /// IDs of nodes that failed.
    pub failed: Vec<String>,
    /// The first fatal cause, for failed runs.
    pub error: Option<String>,
}

/// What a node task reports back to the scheduler.
struct NodeOutcome {
    node_id: String,
    kind: NodeKind,
    retries: u32,
    started_at: chrono::DateTime<Utc>,
    result: Result<NodeOutput, ExecutionError>,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Drives one workflow run at a time to a terminal status.
pub struct WorkflowExecutor<R: RunRepository> {
    registry: Arc<NodeExecutorRegistry>,
    approvals: Arc<ApprovalManager>,
    repo: Arc<R>,
    event_bus: EventBus,
    config: ExecutorConfig,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    current_run: Mutex<Option<Uuid>>,
}

impl<R: RunRepository + 'static> WorkflowExecutor<R> {
    pub fn new(
        registry: Arc<NodeExecutorRegistry>,
        approvals: Arc<ApprovalManager>,
        repo: Arc<R>,
        event_bus: EventBus,
    ) -> Self {
        Self::with_config(registry, approvals, repo, event_bus, ExecutorConfig::default())
    }

    pub fn with_config(
        registry: Arc<NodeExecutorRegistry>,
        approvals: Arc<ApprovalManager>,
        repo: Arc<R>,
        event_bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            approvals,
            repo,
            event_bus,
            config,
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            current_run: Mutex::new(None),
        }
    }

    /// The bus this executor emits on.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Execute a workflow from the beginning.
    ///
    /// Returns `Err` only for validation failures; execution failures are
    /// reported through the result's status and error fields.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        context: RunContext,
    ) -> Result<ExecutionResult, ValidationError> {
        self.run(workflow, context, HashSet::new()).await
    }

    /// Resume a run from a completed-node checkpoint.
    ///
    /// Nodes in `completed` are never re-executed; the caller rebuilds the
    /// context from persisted outputs (see [`RunContext::restore`]). Failed
    /// and running sets start empty, so previously-failed nodes are retried.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        context: RunContext,
        completed: Vec<String>,
    ) -> Result<ExecutionResult, ValidationError> {
        self.run(workflow, context, completed.into_iter().collect())
            .await
    }

    /// Request cooperative cancellation of the current run.
    ///
    /// Stops further dispatch and cancels the run's pending approvals.
    /// In-flight nodes run to completion under their own timeouts.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(run_id) = *self.current_run.lock().unwrap() {
            let swept = self.approvals.cancel_run(run_id);
            if swept > 0 {
                tracing::info!(run_id = %run_id, swept, "cancelled pending approvals");
            }
        }
        self.cancel_notify.notify_waiters();
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Scheduling loop
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        workflow: &Workflow,
        mut ctx: RunContext,
        completed_seed: HashSet<String>,
    ) -> Result<ExecutionResult, ValidationError> {
        let run_id = ctx.run_id;
        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.current_run.lock().unwrap() = Some(run_id);

        if let Err(err) = dag::validate(workflow) {
            let message = err.to_string();
            self.emit(run_id, ExecutionEventKind::WorkflowFailed {
                error: message.clone(),
            });
            self.update_run_status(run_id, RunStatus::Failed, Some(&message))
                .await;
            *self.current_run.lock().unwrap() = None;
            return Err(err);
        }

        // Workflow-level vars are visible to every node; run inputs win on
        // key collisions.
        for (key, value) in &workflow.vars {
            ctx.variables
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        self.update_run_status(run_id, RunStatus::Running, None).await;

        tracing::info!(
            run_id = %run_id,
            workflow = workflow.name.as_str(),
            nodes = workflow.nodes.len(),
            resumed = completed_seed.len(),
            "starting workflow execution"
        );

        let total = workflow.nodes.len();
        let mut completed = completed_seed;
        let mut running: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut first_error: Option<String> = None;
        let mut stuck_message: Option<String> = None;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<NodeOutcome>();

        while completed.len() < total && !self.cancelled() {
            let candidates: Vec<String> = dag::runnable(workflow, &completed)
                .into_iter()
                .filter(|id| !running.contains(id) && !failed.contains(id))
                .collect();

            if candidates.is_empty() && running.is_empty() {
                let mut remainder: Vec<&str> = workflow
                    .nodes
                    .iter()
                    .map(|n| n.id.as_str())
                    .filter(|id| !completed.contains(*id) && !failed.contains(*id))
                    .collect();
                remainder.sort_unstable();
                stuck_message = Some(format!(
                    "no runnable nodes remain; unfinished: [{}]",
                    remainder.join(", ")
                ));
                break;
            }

            let capacity = self.config.max_concurrent.saturating_sub(running.len());
            if capacity > 0 && !candidates.is_empty() {
                for node_id in candidates.into_iter().take(capacity) {
                    let Some(node) = workflow.node(&node_id) else {
                        continue;
                    };
                    self.dispatch(node, &ctx, &mut running, &mut failed, &done_tx)
                        .await;
                }
                continue;
            }

            // At capacity or nothing runnable yet: wait for the next
            // completion (or a cancel signal).
            tokio::select! {
                outcome = done_rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    self.finish_node(
                        outcome,
                        &mut ctx,
                        &mut running,
                        &mut completed,
                        &mut failed,
                        &mut first_error,
                    )
                    .await;
                }
                _ = self.cancel_notify.notified() => {}
            }
        }

        // Let in-flight nodes run to completion and record their outcomes.
        while !running.is_empty() {
            let Some(outcome) = done_rx.recv().await else {
                break;
            };
            self.finish_node(
                outcome,
                &mut ctx,
                &mut running,
                &mut completed,
                &mut failed,
                &mut first_error,
            )
            .await;
        }

        let status = if self.cancelled() {
            RunStatus::Cancelled
        } else if completed.len() == total {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let error = match status {
            RunStatus::Failed => first_error.clone().or(stuck_message),
            _ => None,
        };

        match status {
            RunStatus::Completed => {
                self.emit(run_id, ExecutionEventKind::WorkflowCompleted);
            }
            RunStatus::Failed => {
                self.emit(run_id, ExecutionEventKind::WorkflowFailed {
                    error: error.clone().unwrap_or_else(|| "workflow failed".to_string()),
                });
            }
            // Cancellation is observable through the run status, not an
            // event of its own.
            _ => {}
        }

        self.update_run_status(run_id, status, error.as_deref()).await;
        *self.current_run.lock().unwrap() = None;

        tracing::info!(
            run_id = %run_id,
            status = ?status,
            completed = completed.len(),
            failed = failed.len(),
            "workflow execution finished"
        );

        let mut completed: Vec<String> = completed.into_iter().collect();
        completed.sort_unstable();
        let mut failed: Vec<String> = failed.into_iter().collect();
        failed.sort_unstable();

        Ok(ExecutionResult {
            run_id,
            status,
            context: ctx,
            completed,
            failed,
            error,
        })
    }

    /// Start one node as an independent task.
    async fn dispatch(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
        running: &mut HashSet<String>,
        failed: &mut HashSet<String>,
        done_tx: &mpsc::UnboundedSender<NodeOutcome>,
    ) {
        let run_id = ctx.run_id;
        let kind = node.kind();

        // A node kind nobody registered an executor for fails without an
        // event.
        if self.registry.get(kind).is_none() {
            failed.insert(node.id.clone());
            tracing::error!(
                run_id = %run_id,
                node_id = node.id.as_str(),
                kind = kind.as_str(),
                "no executor registered for node kind"
            );
            return;
        }

        running.insert(node.id.clone());
        self.emit(run_id, ExecutionEventKind::NodeStarted {
            node_id: node.id.clone(),
        });

        if let NodeConfig::Human(cfg) = &node.config {
            let payload = serde_json::to_value(cfg).unwrap_or_default();
            self.emit(run_id, ExecutionEventKind::WaitingApproval {
                node_id: node.id.clone(),
                payload,
            });
            self.update_run_status(run_id, RunStatus::Waiting, None).await;
        }

        let registry = Arc::clone(&self.registry);
        let node = node.clone();
        let ctx_snapshot = ctx.clone();
        let node_timeout = self.config.node_timeout;
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let started_at = Utc::now();
            let attempted = registry
                .execute_with_retry(&node, &ctx_snapshot, node_timeout)
                .await;
            let _ = done_tx.send(NodeOutcome {
                node_id: node.id.clone(),
                kind: node.kind(),
                retries: attempted.retries,
                started_at,
                result: attempted.result,
            });
        });
    }

    /// Record one node outcome: update sets, store the output, persist the
    /// terminal transition, emit the terminal event.
    async fn finish_node(
        &self,
        outcome: NodeOutcome,
        ctx: &mut RunContext,
        running: &mut HashSet<String>,
        completed: &mut HashSet<String>,
        failed: &mut HashSet<String>,
        first_error: &mut Option<String>,
    ) {
        let run_id = ctx.run_id;
        running.remove(&outcome.node_id);
        let ended_at = Utc::now();

        match outcome.result {
            Ok(output) => {
                completed.insert(outcome.node_id.clone());
                ctx.set_output(outcome.node_id.clone(), output.output.clone());

                self.persist_node(run_id, RunNodeUpdate {
                    node_id: outcome.node_id.clone(),
                    kind: outcome.kind,
                    status: RunNodeStatus::Completed,
                    output: Some(output.output.clone()),
                    error: None,
                    retries: outcome.retries,
                    started_at: outcome.started_at,
                    ended_at,
                })
                .await;

                self.emit(run_id, ExecutionEventKind::NodeCompleted {
                    node_id: outcome.node_id,
                    output: output.output,
                });

                // A resolved approval puts the run back to running.
                if outcome.kind == NodeKind::Human {
                    self.update_run_status(run_id, RunStatus::Running, None).await;
                }
            }
            Err(err) => {
                failed.insert(outcome.node_id.clone());
                let message = err.to_string();
                if first_error.is_none() {
                    *first_error =
                        Some(format!("node '{}' failed: {message}", outcome.node_id));
                }

                self.persist_node(run_id, RunNodeUpdate {
                    node_id: outcome.node_id.clone(),
                    kind: outcome.kind,
                    status: RunNodeStatus::Failed,
                    output: None,
                    error: Some(message.clone()),
                    retries: outcome.retries,
                    started_at: outcome.started_at,
                    ended_at,
                })
                .await;

                self.emit(run_id, ExecutionEventKind::NodeFailed {
                    node_id: outcome.node_id,
                    error: message,
                });
            }
        }
    }

    fn emit(&self, run_id: Uuid, kind: ExecutionEventKind) {
        self.event_bus.publish(ExecutionEvent::now(run_id, kind));
    }

    /// Best-effort node-state persistence; failures are logged and
    /// swallowed so durability trouble never stalls the scheduler.
    async fn persist_node(&self, run_id: Uuid, update: RunNodeUpdate) {
        if let Err(e) = self.repo.upsert_run_node(&run_id, &update).await {
            tracing::warn!(
                run_id = %run_id,
                node_id = update.node_id.as_str(),
                error = %e,
                "failed to persist node state"
            );
        }
    }

    /// Best-effort compare-and-set of the run status.
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus, error: Option<&str>) {
        let ended_at = status.is_terminal().then(Utc::now);
        match self
            .repo
            .update_run_status(&run_id, status, error, ended_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(run_id = %run_id, status = ?status, "run already terminal, status unchanged");
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to persist run status");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
