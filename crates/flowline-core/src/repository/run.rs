//! Run repository trait definition.
//!
//! Defines the storage interface for workflow definitions, execution runs,
//! and per-node execution records. The infrastructure layer
//! (flowline-infra) implements this trait with SQLite persistence.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::workflow::{Run, RunNode, RunNodeUpdate, RunStatus, Workflow};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Covers three entity families:
/// - **Workflows:** upsert/get for immutable workflow definitions.
/// - **Runs:** create/update/query workflow execution instances.
/// - **Run nodes:** upsert/query per-node execution records.
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_workflow(
        &self,
        tenant_id: &str,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Compare-and-set the run status.
    ///
    /// Returns `true` when the update was applied. A run that already
    /// reached a terminal status is left untouched and `false` is returned,
    /// so a cancel racing natural termination is a no-op.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// List runs that were left in a non-terminal status (crash recovery).
    fn list_interrupted_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Run nodes
    // -----------------------------------------------------------------------

    /// Upsert the execution record for one `(run, node)` pair.
    fn upsert_run_node(
        &self,
        run_id: &Uuid,
        update: &RunNodeUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all node records for a run, ordered by started_at ASC.
    fn list_run_nodes(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<RunNode>, RepositoryError>> + Send;
}
