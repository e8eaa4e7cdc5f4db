//! JSON-RPC protocol types for the tool-server dialect.
//!
//! Framing invariants: every message carries `jsonrpc: "2.0"`. A message
//! with an `id` and a `method` is a request; with an `id` and a
//! `result`/`error` it is a response; with a `method` but no `id` it is a
//! notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowline_types::server::{ServerInfo, ToolDefinition};

/// The JSON-RPC version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// The protocol revision sent during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ---------------------------------------------------------------------------
// Request / response / notification frames
// ---------------------------------------------------------------------------

/// Request ID (string or number). Generated by the client, unique within a
/// connection, and correlates the response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// An incoming JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl RpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC notification (no `id`, no reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Standard and dialect-specific error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_ERROR: i32 = -32000;
    pub const TOOL_NOT_FOUND: i32 = -32001;
    pub const TOOL_EXECUTION_ERROR: i32 = -32002;
}

// ---------------------------------------------------------------------------
// Incoming message classification
// ---------------------------------------------------------------------------

/// A classified incoming message.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
    /// A server-initiated request. This client does not serve requests;
    /// callers log and drop these.
    Request(RpcRequest),
}

/// Classify a raw JSON value per the framing invariants.
pub fn classify(value: Value) -> Result<IncomingMessage, serde_json::Error> {
    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();

    if has_id && has_method {
        serde_json::from_value(value).map(IncomingMessage::Request)
    } else if has_id {
        serde_json::from_value(value).map(IncomingMessage::Response)
    } else {
        serde_json::from_value(value).map(IncomingMessage::Notification)
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// Request and notification method names.
pub mod methods {
    // Lifecycle
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const PING: &str = "ping";
    pub const SHUTDOWN: &str = "shutdown";

    // Tools
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

    // Prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";

    // Resources
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
}

// ---------------------------------------------------------------------------
// Result payloads
// ---------------------------------------------------------------------------

/// The reply to `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: Value,
}

/// The reply to `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// The reply to `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// Content blocks in a tool-call reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

/// A prompt advertised via `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

/// The reply to `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsListResult {
    #[serde(default)]
    pub prompts: Vec<PromptDefinition>,
}

/// A resource advertised via `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The reply to `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesListResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = RpcRequest::new(7, methods::TOOLS_CALL)
            .with_params(json!({ "name": "fetch", "arguments": {} }));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["method"], "tools/call");
        assert_eq!(wire["params"]["name"], "fetch");
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = RpcNotification::new(methods::INITIALIZED);
        let wire = serde_json::to_value(&notification).unwrap();
        assert!(wire.get("id").is_none());
        assert_eq!(wire["method"], "initialized");
    }

    #[test]
    fn test_classify_response() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": { "tools": [] }
        }))
        .unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                assert_eq!(resp.id, RequestId::Number(3));
                assert!(!resp.is_error());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "id": "req-9",
            "error": { "code": -32001, "message": "tool not found" }
        }))
        .unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                assert!(resp.is_error());
                let err = resp.error.unwrap();
                assert_eq!(err.code, error_codes::TOOL_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }))
        .unwrap();
        match msg {
            IncomingMessage::Notification(n) => {
                assert_eq!(n.method, methods::TOOLS_LIST_CHANGED);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_request() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sampling/createMessage",
            "params": {}
        }))
        .unwrap();
        assert!(matches!(msg, IncomingMessage::Request(_)));
    }

    #[test]
    fn test_classify_garbage_fails() {
        assert!(classify(json!({ "jsonrpc": "2.0" })).is_err());
    }

    #[test]
    fn test_initialize_result_wire_names() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": { "name": "fetcher", "version": "0.3.1" },
            "capabilities": { "tools": {} }
        }))
        .unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(result.server_info.name, "fetcher");
    }

    #[test]
    fn test_tool_call_result_defaults() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "4 results" }]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert!(matches!(result.content[0], ToolContent::Text { .. }));
    }

    #[test]
    fn test_request_id_string_or_number_roundtrip() {
        let n: RequestId = serde_json::from_value(json!(12)).unwrap();
        assert_eq!(n, RequestId::Number(12));
        let s: RequestId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(s, RequestId::String("abc".to_string()));
        assert_eq!(serde_json::to_value(&n).unwrap(), json!(12));
    }
}
