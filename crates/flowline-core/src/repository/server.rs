//! Tool-server repository trait definition.
//!
//! Registered servers outlive individual connections, so the connection
//! manager persists the full record on every lifecycle transition and
//! reloads all records on process start.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::server::{RegisteredServer, ServerStatus};
use uuid::Uuid;

/// Repository trait for registered tool servers.
pub trait ServerRepository: Send + Sync {
    /// Upsert the full server record (insert or replace by ID).
    fn save_server(
        &self,
        server: &RegisteredServer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update only the lifecycle status fields of a server.
    fn update_server_status(
        &self,
        id: &Uuid,
        status: ServerStatus,
        error: Option<&str>,
        connected_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load every persisted server record (startup recovery).
    fn load_servers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RegisteredServer>, RepositoryError>> + Send;

    /// Delete a server registration. Returns `true` if it existed.
    fn delete_server(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
