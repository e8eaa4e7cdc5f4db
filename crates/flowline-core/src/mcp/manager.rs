//! Tool-server connection manager.
//!
//! Owns the map of registered servers. For each server it owns the
//! transport, the protocol client, the lifecycle state machine
//! (`disconnected -> connecting -> connected -> disconnected`, with a
//! sticky `error` state cleared only by a new connect), and the capability
//! caches. External callers hold only server IDs.
//!
//! # Connect sequence
//!
//! 1. Transition to `connecting`; persist.
//! 2. Instantiate the transport by kind (stdio / http / websocket).
//! 3. Instantiate a protocol client over it.
//! 4. `initialize` handshake, then the `initialized` notification.
//! 5. `tools/list` into the capability cache.
//! 6. Transition to `connected`; persist.
//!
//! Any step failure lands the server in `error` with the message recorded
//! and the transport closed.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowline_types::error::RepositoryError;
use flowline_types::server::{
    RegisteredServer, ServerInfo, ServerStatus, ToolDefinition, TransportConfig,
};

use crate::repository::ServerRepository;

use super::client::{RpcClient, RpcError};
use super::protocol::{methods, PromptDefinition, ResourceDescriptor, ToolCallResult};
use super::transport::{
    BoxTransport, HttpTransport, StdioTransport, TransportError, WebsocketTransport,
};

/// Errors from connection-manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("server {0} is not registered")]
    UnknownServer(Uuid),

    #[error("server '{0}' is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A registered server plus its live connection, when any.
struct ManagedServer {
    record: RegisteredServer,
    client: Option<Arc<RpcClient>>,
    watcher: Option<JoinHandle<()>>,
    prompts: Option<Vec<PromptDefinition>>,
    resources: Option<Vec<ResourceDescriptor>>,
}

impl ManagedServer {
    fn new(record: RegisteredServer) -> Self {
        Self {
            record,
            client: None,
            watcher: None,
            prompts: None,
            resources: None,
        }
    }
}

/// The connection manager.
///
/// Generic over `R: ServerRepository` for storage flexibility. Methods that
/// spawn background work (`connect`, `restore_persisted`) take
/// `self: &Arc<Self>`.
pub struct ServerManager<R: ServerRepository> {
    repo: Arc<R>,
    servers: DashMap<Uuid, ManagedServer>,
    /// Registration order, for deterministic tool auto-discovery.
    order: Mutex<Vec<Uuid>>,
    client_name: String,
    client_version: String,
}

impl<R: ServerRepository + 'static> ServerManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            servers: DashMap::new(),
            order: Mutex::new(Vec::new()),
            client_name: "flowline".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Registration lifecycle
    // -----------------------------------------------------------------------

    /// Register a server. Persists the record; when `auto_connect` is set,
    /// immediately attempts to connect (a failed connect leaves the server
    /// registered, in `error`).
    pub async fn register(
        self: &Arc<Self>,
        tenant_id: &str,
        name: &str,
        description: Option<String>,
        transport: TransportConfig,
        auto_connect: bool,
    ) -> Result<Uuid, ManagerError> {
        let mut record = RegisteredServer::new(tenant_id, name, transport);
        record.description = description;
        let id = record.id;

        self.repo.save_server(&record).await?;
        self.servers.insert(id, ManagedServer::new(record));
        self.order.lock().unwrap().push(id);

        tracing::info!(server_id = %id, name, "registered tool server");

        if auto_connect {
            self.connect(id).await?;
        }
        Ok(id)
    }

    /// Remove a registration entirely. Disconnects first when connected.
    pub async fn unregister(&self, id: Uuid) -> Result<(), ManagerError> {
        if !self.servers.contains_key(&id) {
            return Err(ManagerError::UnknownServer(id));
        }
        self.disconnect(id).await?;
        self.repo.delete_server(&id).await?;
        self.servers.remove(&id);
        self.order.lock().unwrap().retain(|entry| *entry != id);

        tracing::info!(server_id = %id, "unregistered tool server");
        Ok(())
    }

    /// Connect a registered server.
    ///
    /// Reconnecting an already-connected server tears the old connection
    /// down first. A fresh connect clears the stale tool cache and
    /// repopulates it from `tools/list`.
    pub async fn connect(self: &Arc<Self>, id: Uuid) -> Result<(), ManagerError> {
        let transport_config = {
            let entry = self
                .servers
                .get(&id)
                .ok_or(ManagerError::UnknownServer(id))?;
            entry.record.transport.clone()
        };

        self.teardown_connection(id).await;
        self.transition(id, ServerStatus::Connecting, None).await;

        match self.establish(&transport_config).await {
            Ok((client, server_info, tools)) => {
                let watcher = tokio::spawn(Self::watch_connection(
                    Arc::clone(self),
                    id,
                    Arc::clone(&client),
                ));

                if let Some(mut entry) = self.servers.get_mut(&id) {
                    entry.record.status = ServerStatus::Connected;
                    entry.record.server_info = Some(server_info);
                    entry.record.tools = Some(tools);
                    entry.record.error = None;
                    entry.record.connected_at = Some(Utc::now());
                    entry.record.updated_at = Utc::now();
                    entry.client = Some(client);
                    entry.watcher = Some(watcher);
                    entry.prompts = None;
                    entry.resources = None;
                } else {
                    watcher.abort();
                    let _ = client.close().await;
                    return Err(ManagerError::UnknownServer(id));
                }

                self.persist(id).await;
                tracing::info!(server_id = %id, "tool server connected");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(mut entry) = self.servers.get_mut(&id) {
                    entry.record.status = ServerStatus::Error;
                    entry.record.error = Some(message.clone());
                    entry.record.updated_at = Utc::now();
                }
                self.persist(id).await;
                tracing::warn!(server_id = %id, error = message.as_str(), "tool server connect failed");
                Err(err)
            }
        }
    }

    /// Disconnect a server without removing the registration. The cached
    /// tool list is retained for diagnostics.
    pub async fn disconnect(&self, id: Uuid) -> Result<(), ManagerError> {
        if !self.servers.contains_key(&id) {
            return Err(ManagerError::UnknownServer(id));
        }
        self.teardown_connection(id).await;
        self.transition(id, ServerStatus::Disconnected, None).await;
        tracing::info!(server_id = %id, "tool server disconnected");
        Ok(())
    }

    /// Load all persisted server records. Servers that were `connected`
    /// when the process died are re-connected in the background; a failed
    /// reconnect lands in `error` and never fails process start.
    pub async fn restore_persisted(self: &Arc<Self>) -> Result<(), ManagerError> {
        let records = self.repo.load_servers().await?;
        let mut reconnect = Vec::new();

        for record in records {
            let id = record.id;
            let was_connected = record.status == ServerStatus::Connected;
            let mut managed = ManagedServer::new(record);
            // No live connection yet, whatever the row said.
            if managed.record.status == ServerStatus::Connecting
                || managed.record.status == ServerStatus::Connected
            {
                managed.record.status = ServerStatus::Disconnected;
            }
            self.servers.insert(id, managed);
            self.order.lock().unwrap().push(id);
            if was_connected {
                reconnect.push(id);
            }
        }

        for id in reconnect {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.connect(id).await {
                    tracing::warn!(server_id = %id, error = %e, "startup reconnect failed");
                }
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of one server's record.
    pub fn get(&self, id: Uuid) -> Option<RegisteredServer> {
        self.servers.get(&id).map(|entry| entry.record.clone())
    }

    /// Snapshot of all server records, in registration order.
    pub fn list(&self) -> Vec<RegisteredServer> {
        let order = self.order.lock().unwrap().clone();
        order
            .iter()
            .filter_map(|id| self.servers.get(id).map(|entry| entry.record.clone()))
            .collect()
    }

    /// The cached tool list for a server.
    pub fn tools(&self, id: Uuid) -> Option<Vec<ToolDefinition>> {
        self.servers.get(&id).and_then(|entry| entry.record.tools.clone())
    }

    /// Find the first connected server advertising a tool with this name.
    ///
    /// Servers are scanned in registration order, which makes tie-breaking
    /// deterministic within a process. When `tenant_id` is given, only that
    /// tenant's servers are considered.
    pub fn find_tool(
        &self,
        name: &str,
        tenant_id: Option<&str>,
    ) -> Option<(Uuid, ToolDefinition)> {
        let order = self.order.lock().unwrap().clone();
        for id in order {
            let Some(entry) = self.servers.get(&id) else {
                continue;
            };
            if entry.record.status != ServerStatus::Connected {
                continue;
            }
            if let Some(tenant) = tenant_id {
                if entry.record.tenant_id != tenant {
                    continue;
                }
            }
            if let Some(tool) = entry
                .record
                .tools
                .as_ref()
                .and_then(|tools| tools.iter().find(|t| t.name == name))
            {
                return Some((id, tool.clone()));
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call a tool on a connected server.
    pub async fn call_tool(
        &self,
        id: Uuid,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, ManagerError> {
        let client = self.connected_client(id)?;
        Ok(client.call_tool(name, arguments).await?)
    }

    /// Liveness probe against a connected server.
    pub async fn ping(&self, id: Uuid) -> Result<(), ManagerError> {
        let client = self.connected_client(id)?;
        Ok(client.ping().await?)
    }

    /// List a connected server's prompts (cached after the first fetch).
    pub async fn list_prompts(&self, id: Uuid) -> Result<Vec<PromptDefinition>, ManagerError> {
        if let Some(entry) = self.servers.get(&id) {
            if let Some(prompts) = &entry.prompts {
                return Ok(prompts.clone());
            }
        }
        let client = self.connected_client(id)?;
        let prompts = client.list_prompts().await?;
        if let Some(mut entry) = self.servers.get_mut(&id) {
            entry.prompts = Some(prompts.clone());
        }
        Ok(prompts)
    }

    /// Fetch one prompt's content from a connected server.
    pub async fn get_prompt(
        &self,
        id: Uuid,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ManagerError> {
        let client = self.connected_client(id)?;
        Ok(client.get_prompt(name, arguments).await?)
    }

    /// List a connected server's resources (cached after the first fetch).
    pub async fn list_resources(
        &self,
        id: Uuid,
    ) -> Result<Vec<ResourceDescriptor>, ManagerError> {
        if let Some(entry) = self.servers.get(&id) {
            if let Some(resources) = &entry.resources {
                return Ok(resources.clone());
            }
        }
        let client = self.connected_client(id)?;
        let resources = client.list_resources().await?;
        if let Some(mut entry) = self.servers.get_mut(&id) {
            entry.resources = Some(resources.clone());
        }
        Ok(resources)
    }

    /// Read one resource by URI from a connected server.
    pub async fn read_resource(&self, id: Uuid, uri: &str) -> Result<Value, ManagerError> {
        let client = self.connected_client(id)?;
        Ok(client.read_resource(uri).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn connected_client(&self, id: Uuid) -> Result<Arc<RpcClient>, ManagerError> {
        let entry = self
            .servers
            .get(&id)
            .ok_or(ManagerError::UnknownServer(id))?;
        if entry.record.status != ServerStatus::Connected {
            return Err(ManagerError::NotConnected(entry.record.name.clone()));
        }
        entry
            .client
            .clone()
            .ok_or_else(|| ManagerError::NotConnected(entry.record.name.clone()))
    }

    /// Build the transport, run the handshake, and fetch the tool list.
    async fn establish(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<RpcClient>, ServerInfo, Vec<ToolDefinition>), ManagerError> {
        let (transport, incoming) = match config {
            TransportConfig::Stdio { command, args, env } => {
                let (t, rx) = StdioTransport::spawn(command, args, env)?;
                (BoxTransport::new(t), rx)
            }
            TransportConfig::Http { url, headers } => {
                let (t, rx) = HttpTransport::new(url.clone(), headers.clone())?;
                (BoxTransport::new(t), rx)
            }
            TransportConfig::Websocket {
                url,
                protocols,
                headers,
            } => {
                let (t, rx) = WebsocketTransport::connect(url, protocols, headers).await?;
                (BoxTransport::new(t), rx)
            }
        };

        let client = Arc::new(RpcClient::new(transport, incoming));

        let handshake = async {
            let init = client
                .initialize(&self.client_name, &self.client_version)
                .await?;
            client.initialized().await?;
            let tools = client.list_tools().await?;
            Ok::<_, RpcError>((init, tools))
        };

        match handshake.await {
            Ok((init, tools)) => Ok((client, init.server_info, tools)),
            Err(err) => {
                let _ = client.close().await;
                Err(err.into())
            }
        }
    }

    /// Close and drop a server's live connection, if any.
    async fn teardown_connection(&self, id: Uuid) {
        let (client, watcher) = match self.servers.get_mut(&id) {
            Some(mut entry) => (entry.client.take(), entry.watcher.take()),
            None => return,
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(client) = client {
            // Best-effort: tell the server we are going, then drop the
            // transport and reject everything pending.
            let _ = client.shutdown().await;
            let _ = client.close().await;
        }
    }

    /// Update a server's in-memory status and persist the delta.
    async fn transition(&self, id: Uuid, status: ServerStatus, error: Option<String>) {
        let connected_at = {
            let Some(mut entry) = self.servers.get_mut(&id) else {
                return;
            };
            entry.record.status = status;
            entry.record.error = error.clone();
            entry.record.updated_at = Utc::now();
            if status != ServerStatus::Connected {
                entry.record.connected_at = None;
            }
            entry.record.connected_at
        };

        if let Err(e) = self
            .repo
            .update_server_status(&id, status, error.as_deref(), connected_at)
            .await
        {
            tracing::warn!(server_id = %id, error = %e, "failed to persist server status");
        }
    }

    /// Persist a server's full record, best-effort.
    async fn persist(&self, id: Uuid) {
        let record = match self.servers.get(&id) {
            Some(entry) => entry.record.clone(),
            None => return,
        };
        if let Err(e) = self.repo.save_server(&record).await {
            tracing::warn!(server_id = %id, error = %e, "failed to persist server record");
        }
    }

    /// Background watcher for one connection: refreshes capability caches
    /// on `*_changed` notifications and transitions the server to
    /// `disconnected` when the transport closes underneath it.
    async fn watch_connection(manager: Arc<Self>, id: Uuid, client: Arc<RpcClient>) {
        let mut notifications = client.subscribe_notifications();
        let mut closed = client.closed_signal();

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    match notification {
                        Ok(n) => manager.handle_notification(id, &client, &n.method).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(server_id = %id, skipped, "notification stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        manager.handle_transport_closed(id).await;
                        break;
                    }
                }
            }
        }
    }

    async fn handle_notification(&self, id: Uuid, client: &Arc<RpcClient>, method: &str) {
        match method {
            methods::TOOLS_LIST_CHANGED => match client.list_tools().await {
                Ok(tools) => {
                    if let Some(mut entry) = self.servers.get_mut(&id) {
                        entry.record.tools = Some(tools);
                        entry.record.updated_at = Utc::now();
                    }
                    self.persist(id).await;
                    tracing::debug!(server_id = %id, "tool cache refreshed");
                }
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "tool cache refresh failed");
                }
            },
            methods::PROMPTS_LIST_CHANGED => match client.list_prompts().await {
                Ok(prompts) => {
                    if let Some(mut entry) = self.servers.get_mut(&id) {
                        entry.prompts = Some(prompts);
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "prompt cache refresh failed");
                }
            },
            methods::RESOURCES_LIST_CHANGED => match client.list_resources().await {
                Ok(resources) => {
                    if let Some(mut entry) = self.servers.get_mut(&id) {
                        entry.resources = Some(resources);
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "resource cache refresh failed");
                }
            },
            // Other notifications already reached the client's subscribers.
            other => {
                tracing::debug!(server_id = %id, method = other, "unhandled notification");
            }
        }
    }

    /// The transport died underneath a connected server: reject pending
    /// requests, keep the cached tool list for diagnostics, and mark the
    /// server disconnected.
    async fn handle_transport_closed(&self, id: Uuid) {
        let was_connected = self
            .servers
            .get(&id)
            .map(|entry| entry.record.status == ServerStatus::Connected)
            .unwrap_or(false);
        if !was_connected {
            return;
        }

        if let Some(mut entry) = self.servers.get_mut(&id) {
            if let Some(client) = entry.client.take() {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let _ = client.close().await;
                });
            }
            entry.watcher = None;
        }
        self.transition(id, ServerStatus::Disconnected, None).await;
        tracing::warn!(server_id = %id, "tool server transport closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
