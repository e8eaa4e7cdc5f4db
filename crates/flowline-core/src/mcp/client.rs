//! JSON-RPC protocol client.
//!
//! Correlates outgoing requests with incoming responses through the shared
//! pending-wait table: every request registers a completion handle keyed by
//! its ID, and a background receive loop resolves handles as responses
//! arrive. Requests reject on their deadline (default 30 s) or, when the
//! transport dies, with a connection-closed error. Every outgoing request
//! therefore completes with exactly one response, a timeout, or a
//! connection-closed rejection.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use flowline_types::server::ToolDefinition;

use crate::pending::PendingMap;

use super::protocol::{
    self, methods, IncomingMessage, InitializeResult, PromptDefinition, PromptsListResult,
    RequestId, ResourceDescriptor, ResourcesListResult, RpcNotification, RpcRequest,
    ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};
use super::transport::{BoxTransport, TransportError};

/// Default deadline for an outgoing request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the protocol client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No response arrived before the deadline.
    #[error("request '{method}' timed out after {seconds} s")]
    Timeout { method: String, seconds: u64 },

    /// The transport closed while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The server's reply did not match the expected payload shape.
    #[error("invalid response payload: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A JSON-RPC client over one transport connection.
pub struct RpcClient {
    transport: BoxTransport,
    pending: Arc<PendingMap<RequestId, Result<Value, RpcError>>>,
    next_id: AtomicI64,
    request_timeout: Duration,
    notifications: broadcast::Sender<RpcNotification>,
    closed: watch::Receiver<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a client over a transport and its incoming message channel,
    /// with the default request deadline.
    pub fn new(transport: BoxTransport, incoming: mpsc::UnboundedReceiver<Value>) -> Self {
        Self::with_timeout(transport, incoming, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request deadline.
    pub fn with_timeout(
        transport: BoxTransport,
        incoming: mpsc::UnboundedReceiver<Value>,
        request_timeout: Duration,
    ) -> Self {
        let pending: Arc<PendingMap<RequestId, Result<Value, RpcError>>> =
            Arc::new(PendingMap::new());
        let (notifications, _) = broadcast::channel(64);
        let (closed_tx, closed) = watch::channel(false);

        let recv_task = tokio::spawn(Self::receive_loop(
            incoming,
            Arc::clone(&pending),
            notifications.clone(),
            closed_tx,
        ));

        Self {
            transport,
            pending,
            next_id: AtomicI64::new(1),
            request_timeout,
            notifications,
            closed,
            recv_task: Mutex::new(Some(recv_task)),
        }
    }

    /// Route incoming messages until the transport channel closes, then
    /// reject everything still outstanding.
    async fn receive_loop(
        mut incoming: mpsc::UnboundedReceiver<Value>,
        pending: Arc<PendingMap<RequestId, Result<Value, RpcError>>>,
        notifications: broadcast::Sender<RpcNotification>,
        closed_tx: watch::Sender<bool>,
    ) {
        while let Some(raw) = incoming.recv().await {
            match protocol::classify(raw) {
                Ok(IncomingMessage::Response(response)) => {
                    let outcome = match response.error {
                        Some(err) => Err(RpcError::Remote {
                            code: err.code,
                            message: err.message,
                            data: err.data,
                        }),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    if !pending.resolve(&response.id, outcome) {
                        tracing::debug!(id = %response.id, "response with unknown id, dropping");
                    }
                }
                Ok(IncomingMessage::Notification(notification)) => {
                    let _ = notifications.send(notification);
                }
                Ok(IncomingMessage::Request(request)) => {
                    tracing::debug!(
                        method = request.method.as_str(),
                        "dropping server-initiated request"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed message from tool server");
                }
            }
        }

        pending.drain_with(|_| Err(RpcError::ConnectionClosed));
        let _ = closed_tx.send(true);
        tracing::debug!("protocol client receive loop ended");
    }

    /// Send a request and await its correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let rx = self.pending.register(id.clone());

        let mut request = RpcRequest::new(id.clone(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        tracing::debug!(method, id = %id, "sending request");

        let wire = serde_json::to_value(&request).map_err(TransportError::Json)?;
        if let Err(e) = self.transport.send(wire).await {
            self.pending.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The completion handle was dropped without resolving.
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    seconds: self.request_timeout.as_secs(),
                })
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let mut notification = protocol::RpcNotification::new(method);
        if let Some(params) = params {
            notification = notification.with_params(params);
        }
        let wire = serde_json::to_value(&notification).map_err(TransportError::Json)?;
        self.transport.send(wire).await?;
        Ok(())
    }

    /// Subscribe to notifications published by the server.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RpcNotification> {
        self.notifications.subscribe()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A watch that flips to `true` when the transport's incoming channel
    /// closes (connection loss or deliberate close).
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Close the transport and reject everything still outstanding.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.transport.close().await?;
        self.pending.drain_with(|_| Err(RpcError::ConnectionClosed));
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle methods
    // -----------------------------------------------------------------------

    /// Perform the `initialize` handshake.
    pub async fn initialize(
        &self,
        client_name: &str,
        client_version: &str,
    ) -> Result<InitializeResult, RpcError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": { "name": client_name, "version": client_version },
            "capabilities": { "tools": {}, "prompts": {}, "resources": {} }
        });
        let result = self.request(methods::INITIALIZE, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse(e.to_string()))
    }

    /// Send the `initialized` notification after a successful handshake.
    pub async fn initialized(&self) -> Result<(), RpcError> {
        self.notify(methods::INITIALIZED, None).await
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<(), RpcError> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Tell the server we are going away.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.notify(methods::SHUTDOWN, None).await
    }

    // -----------------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------------

    /// List the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, RpcError> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;
        Ok(parsed.tools)
    }

    /// Call a tool by name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, RpcError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------------

    /// List the server's prompts.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDefinition>, RpcError> {
        let result = self.request(methods::PROMPTS_LIST, None).await?;
        let parsed: PromptsListResult = serde_json::from_value(result)
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;
        Ok(parsed.prompts)
    }

    /// Fetch one prompt's content.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request(methods::PROMPTS_GET, Some(params)).await
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    /// List the server's resources.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, RpcError> {
        let result = self.request(methods::RESOURCES_LIST, None).await?;
        let parsed: ResourcesListResult = serde_json::from_value(result)
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;
        Ok(parsed.resources)
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, RpcError> {
        let params = json!({ "uri": uri });
        self.request(methods::RESOURCES_READ, Some(params)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
