//! SQLite tool-server repository implementation.
//!
//! The connection manager persists the full `RegisteredServer` record on
//! every lifecycle transition; the transport descriptor, server info, and
//! tool cache are stored as JSON columns so the record round-trips
//! verbatim for startup recovery.

use chrono::{DateTime, Utc};
use flowline_core::repository::ServerRepository;
use flowline_types::error::RepositoryError;
use flowline_types::server::{RegisteredServer, ServerStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ServerRepository`.
pub struct SqliteServerRepository {
    pool: DatabasePool,
}

impl SqliteServerRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<RegisteredServer, RepositoryError> {
    let get = |name: &str| -> Result<String, RepositoryError> {
        row.try_get::<String, _>(name)
            .map_err(|e| RepositoryError::Query(e.to_string()))
    };
    let get_opt = |name: &str| -> Result<Option<String>, RepositoryError> {
        row.try_get::<Option<String>, _>(name)
            .map_err(|e| RepositoryError::Query(e.to_string()))
    };

    let transport = serde_json::from_str(&get("transport")?)
        .map_err(|e| RepositoryError::Query(format!("invalid transport JSON: {e}")))?;
    let status: ServerStatus =
        serde_json::from_value(serde_json::Value::String(get("status")?))
            .map_err(|e| RepositoryError::Query(format!("invalid server status: {e}")))?;
    let server_info = get_opt("server_info")?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| RepositoryError::Query(format!("invalid server_info JSON: {e}")))?;
    let tools = get_opt("tools")?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| RepositoryError::Query(format!("invalid tools JSON: {e}")))?;

    Ok(RegisteredServer {
        id: parse_uuid(&get("id")?)?,
        tenant_id: get("tenant_id")?,
        name: get("name")?,
        description: get_opt("description")?,
        transport,
        status,
        server_info,
        tools,
        error: get_opt("error")?,
        connected_at: get_opt("connected_at")?
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
        created_at: parse_datetime(&get("created_at")?)?,
        updated_at: parse_datetime(&get("updated_at")?)?,
    })
}

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

fn status_str(status: ServerStatus) -> Result<String, RepositoryError> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("unserializable status".to_string())),
    }
}

// ---------------------------------------------------------------------------
// ServerRepository impl
// ---------------------------------------------------------------------------

impl ServerRepository for SqliteServerRepository {
    async fn save_server(&self, server: &RegisteredServer) -> Result<(), RepositoryError> {
        let transport = serde_json::to_string(&server.transport)
            .map_err(|e| RepositoryError::Query(format!("serialize transport: {e}")))?;
        let server_info = server
            .server_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize server_info: {e}")))?;
        let tools = server
            .tools
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize tools: {e}")))?;

        sqlx::query(
            r#"INSERT INTO tool_servers
               (id, tenant_id, name, description, transport, status, server_info, tools, error, connected_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 tenant_id = excluded.tenant_id,
                 name = excluded.name,
                 description = excluded.description,
                 transport = excluded.transport,
                 status = excluded.status,
                 server_info = excluded.server_info,
                 tools = excluded.tools,
                 error = excluded.error,
                 connected_at = excluded.connected_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(server.id.to_string())
        .bind(&server.tenant_id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(transport)
        .bind(status_str(server.status)?)
        .bind(server_info)
        .bind(tools)
        .bind(&server.error)
        .bind(server.connected_at.as_ref().map(format_datetime))
        .bind(format_datetime(&server.created_at))
        .bind(format_datetime(&server.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_server_status(
        &self,
        id: &Uuid,
        status: ServerStatus,
        error: Option<&str>,
        connected_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE tool_servers SET status = ?, error = ?, connected_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status_str(status)?)
        .bind(error)
        .bind(connected_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn load_servers(&self) -> Result<Vec<RegisteredServer>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tool_servers ORDER BY created_at ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(row_to_server).collect()
    }

    async fn delete_server(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM tool_servers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::server::{ToolDefinition, TransportConfig};
    use serde_json::json;
    use std::collections::HashMap;

    async fn test_repo() -> (SqliteServerRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteServerRepository::new(pool), dir)
    }

    fn sample_server() -> RegisteredServer {
        let mut server = RegisteredServer::new(
            "acme",
            "fetcher",
            TransportConfig::Stdio {
                command: "uvx".to_string(),
                args: vec!["mcp-server-fetch".to_string()],
                env: HashMap::new(),
            },
        );
        server.tools = Some(vec![ToolDefinition {
            name: "fetch".to_string(),
            description: Some("Fetch a URL".to_string()),
            input_schema: json!({ "type": "object" }),
        }]);
        server
    }

    #[tokio::test]
    async fn server_record_roundtrips_verbatim() {
        let (repo, _dir) = test_repo().await;
        let server = sample_server();

        repo.save_server(&server).await.unwrap();
        let loaded = repo.load_servers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, server.id);
        assert_eq!(loaded[0].name, "fetcher");
        assert!(matches!(
            loaded[0].transport,
            TransportConfig::Stdio { ref command, .. } if command == "uvx"
        ));
        assert_eq!(loaded[0].tools.as_ref().unwrap()[0].name, "fetch");
    }

    #[tokio::test]
    async fn status_update_writes_error_and_connected_at() {
        let (repo, _dir) = test_repo().await;
        let server = sample_server();
        repo.save_server(&server).await.unwrap();

        let connected_at = Utc::now();
        repo.update_server_status(
            &server.id,
            ServerStatus::Connected,
            None,
            Some(connected_at),
        )
        .await
        .unwrap();

        let loaded = repo.load_servers().await.unwrap();
        assert_eq!(loaded[0].status, ServerStatus::Connected);
        assert!(loaded[0].connected_at.is_some());

        repo.update_server_status(&server.id, ServerStatus::Error, Some("refused"), None)
            .await
            .unwrap();
        let loaded = repo.load_servers().await.unwrap();
        assert_eq!(loaded[0].status, ServerStatus::Error);
        assert_eq!(loaded[0].error.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn status_update_for_unknown_server_is_not_found() {
        let (repo, _dir) = test_repo().await;
        let err = repo
            .update_server_status(&Uuid::now_v7(), ServerStatus::Connected, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (repo, _dir) = test_repo().await;
        let server = sample_server();
        repo.save_server(&server).await.unwrap();

        assert!(repo.delete_server(&server.id).await.unwrap());
        assert!(!repo.delete_server(&server.id).await.unwrap());
        assert!(repo.load_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_servers_orders_by_creation() {
        let (repo, _dir) = test_repo().await;

        let mut first = sample_server();
        first.name = "first".to_string();
        let mut second = sample_server();
        second.id = Uuid::now_v7();
        second.name = "second".to_string();
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        repo.save_server(&second).await.unwrap();
        repo.save_server(&first).await.unwrap();

        let loaded = repo.load_servers().await.unwrap();
        assert_eq!(loaded[0].name, "first");
        assert_eq!(loaded[1].name, "second");
    }
}
