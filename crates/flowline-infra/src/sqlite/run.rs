//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `flowline-core` using sqlx with split
//! read/write pools. Workflow definitions are stored as JSON blobs. Runs
//! and per-node records track execution state for crash recovery and
//! auditing; run status updates are compare-and-set so terminal statuses
//! are never overwritten.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use flowline_core::repository::RunRepository;
use flowline_types::error::RepositoryError;
use flowline_types::workflow::{
    NodeKind, Run, RunNode, RunNodeStatus, RunNodeUpdate, RunStatus, Workflow,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    tenant_id: String,
    status: String,
    inputs: String,
    outputs: Option<String>,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    created_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status: RunStatus = parse_enum(&self.status, "run status")?;
        let inputs: HashMap<String, serde_json::Value> = serde_json::from_str(&self.inputs)
            .map_err(|e| RepositoryError::Query(format!("invalid inputs JSON: {e}")))?;
        let outputs = self
            .outputs
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid outputs JSON: {e}")))
            })
            .transpose()?;

        Ok(Run {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            tenant_id: self.tenant_id,
            status,
            inputs,
            outputs,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct RunNodeRow {
    id: String,
    run_id: String,
    node_id: String,
    kind: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    retries: i64,
    started_at: Option<String>,
    ended_at: Option<String>,
    created_at: String,
}

impl RunNodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            node_id: row.try_get("node_id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            retries: row.try_get("retries")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run_node(self) -> Result<RunNode, RepositoryError> {
        let kind: NodeKind = parse_enum(&self.kind, "node kind")?;
        let status: RunNodeStatus = parse_enum(&self.status, "node status")?;
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid output JSON: {e}")))
            })
            .transpose()?;

        Ok(RunNode {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            node_id: self.node_id,
            kind,
            status,
            output,
            error: self.error,
            retries: self.retries as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a snake_case enum stored as a bare string column.
fn parse_enum<T: serde::de::DeserializeOwned>(
    s: &str,
    what: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

/// Serialize a snake_case enum to its bare string column form.
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("unserializable enum".to_string())),
    }
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save_workflow(
        &self,
        tenant_id: &str,
        workflow: &Workflow,
    ) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(workflow)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, tenant_id, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 tenant_id = excluded.tenant_id,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(tenant_id)
        .bind(definition)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            let definition: String = row
                .try_get("definition")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            serde_json::from_str(&definition)
                .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))
        })
        .transpose()
    }

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let inputs = serde_json::to_string(&run.inputs)
            .map_err(|e| RepositoryError::Query(format!("serialize inputs: {e}")))?;
        let outputs = run
            .outputs
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize outputs: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, tenant_id, status, inputs, outputs, error, started_at, ended_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(&run.tenant_id)
        .bind(enum_str(&run.status)?)
        .bind(inputs)
        .bind(outputs)
        .bind(&run.error)
        .bind(format_datetime(&run.started_at))
        .bind(run.ended_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        // Compare-and-set: rows that already reached a terminal status are
        // left untouched, so cancel racing natural termination is a no-op.
        let query = format!(
            "UPDATE workflow_runs SET status = ?, error = ?, ended_at = ?
             WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&query)
            .bind(enum_str(&status)?)
            .bind(error)
            .bind(ended_at.as_ref().map(format_datetime))
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            RunRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_run()
        })
        .transpose()
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<Run>, RepositoryError> {
        let query = format!(
            "SELECT * FROM workflow_runs WHERE status NOT IN {TERMINAL_STATUSES}
             ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                RunRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn upsert_run_node(
        &self,
        run_id: &Uuid,
        update: &RunNodeUpdate,
    ) -> Result<(), RepositoryError> {
        let output = update
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize output: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_run_nodes
               (id, run_id, node_id, kind, status, output, error, retries, started_at, ended_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, node_id) DO UPDATE SET
                 status = excluded.status,
                 output = excluded.output,
                 error = excluded.error,
                 retries = excluded.retries,
                 started_at = excluded.started_at,
                 ended_at = excluded.ended_at"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(run_id.to_string())
        .bind(&update.node_id)
        .bind(enum_str(&update.kind)?)
        .bind(enum_str(&update.status)?)
        .bind(output)
        .bind(&update.error)
        .bind(update.retries as i64)
        .bind(format_datetime(&update.started_at))
        .bind(format_datetime(&update.ended_at))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_run_nodes(&self, run_id: &Uuid) -> Result<Vec<RunNode>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_nodes WHERE run_id = ? ORDER BY started_at ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                RunNodeRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run_node()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> (SqliteRunRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteRunRepository::new(pool), dir)
    }

    fn sample_workflow() -> Workflow {
        serde_json::from_value(json!({
            "id": Uuid::now_v7().to_string(),
            "name": "daily-digest",
            "version": "1.0.0",
            "nodes": [
                {
                    "id": "gather",
                    "type": "tool",
                    "config": { "command": "curl https://news.example.com" }
                }
            ]
        }))
        .unwrap()
    }

    fn sample_run(workflow_id: Uuid) -> Run {
        Run {
            id: Uuid::now_v7(),
            workflow_id,
            tenant_id: "acme".to_string(),
            status: RunStatus::Running,
            inputs: HashMap::from([("topic".to_string(), json!("rust"))]),
            outputs: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn workflow_definition_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let workflow = sample_workflow();

        repo.save_workflow("acme", &workflow).await.unwrap();
        let loaded = repo.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "daily-digest");
        assert_eq!(loaded.nodes.len(), 1);

        assert!(repo.get_workflow(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_roundtrip_and_status_cas() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run(Uuid::now_v7());
        repo.create_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.inputs["topic"], json!("rust"));

        // Terminal transition applies once.
        let applied = repo
            .update_run_status(&run.id, RunStatus::Completed, None, Some(Utc::now()))
            .await
            .unwrap();
        assert!(applied);

        // A cancel racing in after termination is a no-op.
        let applied = repo
            .update_run_status(&run.id, RunStatus::Cancelled, None, Some(Utc::now()))
            .await
            .unwrap();
        assert!(!applied);

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn interrupted_runs_are_the_non_terminal_ones() {
        let (repo, _dir) = test_repo().await;

        let running = sample_run(Uuid::now_v7());
        repo.create_run(&running).await.unwrap();

        let mut finished = sample_run(Uuid::now_v7());
        finished.id = Uuid::now_v7();
        repo.create_run(&finished).await.unwrap();
        repo.update_run_status(&finished.id, RunStatus::Failed, Some("boom"), Some(Utc::now()))
            .await
            .unwrap();

        let interrupted = repo.list_interrupted_runs().await.unwrap();
        let ids: Vec<Uuid> = interrupted.iter().map(|r| r.id).collect();
        assert!(ids.contains(&running.id));
        assert!(!ids.contains(&finished.id));
    }

    #[tokio::test]
    async fn run_node_upsert_is_one_row_per_node() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run(Uuid::now_v7());
        repo.create_run(&run).await.unwrap();

        let update = RunNodeUpdate {
            node_id: "gather".to_string(),
            kind: NodeKind::Tool,
            status: RunNodeStatus::Failed,
            output: None,
            error: Some("timeout".to_string()),
            retries: 1,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };
        repo.upsert_run_node(&run.id, &update).await.unwrap();

        // A later retry of the same node replaces the row.
        let update = RunNodeUpdate {
            status: RunNodeStatus::Completed,
            output: Some(json!({ "exitCode": 0 })),
            error: None,
            retries: 0,
            ..update
        };
        repo.upsert_run_node(&run.id, &update).await.unwrap();

        let nodes = repo.list_run_nodes(&run.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, RunNodeStatus::Completed);
        assert_eq!(nodes[0].output.as_ref().unwrap()["exitCode"], 0);
        assert!(nodes[0].error.is_none());
    }
}
