//! Registered tool-server types.
//!
//! A `RegisteredServer` outlives individual connections: disconnecting keeps
//! the registration (and the last cached tool list, for diagnostics), while
//! unregistering removes it. The transport descriptor is a tagged union so it
//! round-trips through the persistence layer verbatim.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Transport descriptor
// ---------------------------------------------------------------------------

/// How to reach a tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Launch a child process and speak line-delimited JSON over its pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// POST one JSON value per request; the response body is the reply.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// A single long-lived connection; one JSON value per frame.
    Websocket {
        url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        protocols: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// Server record
// ---------------------------------------------------------------------------

/// Connection lifecycle state of a registered server.
///
/// `Error` is sticky: it is entered from `Connecting` or `Connected` and
/// cleared only by a new connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Identity and capabilities reported by a server during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub capabilities: Value,
}

/// A tool advertised by a server via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A registered tool server and its cached connection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredServer {
    /// UUIDv7 server ID. External callers hold only this.
    pub id: Uuid,
    /// Tenant that owns this registration.
    pub tenant_id: String,
    /// Human-readable server name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How to reach the server.
    pub transport: TransportConfig,
    /// Current lifecycle state.
    pub status: ServerStatus,
    /// Populated after a successful `initialize` handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    /// Cached tool list from the last `tools/list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Last connection error, when status is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the current connection was established.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegisteredServer {
    /// Create a fresh registration in the `Disconnected` state.
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        transport: TransportConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            description: None,
            transport,
            status: ServerStatus::Disconnected,
            server_info: None,
            tools: None,
            error: None,
            connected_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_tagged_union_stdio() {
        let json = json!({
            "type": "stdio",
            "command": "uvx",
            "args": ["mcp-server-fetch"]
        });
        let transport: TransportConfig = serde_json::from_value(json.clone()).unwrap();
        assert!(matches!(
            transport,
            TransportConfig::Stdio { ref command, .. } if command == "uvx"
        ));

        let back = serde_json::to_value(&transport).unwrap();
        assert_eq!(back["type"], "stdio");
        assert_eq!(back["args"][0], "mcp-server-fetch");
    }

    #[test]
    fn test_transport_tagged_union_http_and_websocket() {
        let http: TransportConfig = serde_json::from_value(json!({
            "type": "http",
            "url": "https://tools.example.com/rpc"
        }))
        .unwrap();
        assert!(matches!(http, TransportConfig::Http { .. }));

        let ws: TransportConfig = serde_json::from_value(json!({
            "type": "websocket",
            "url": "wss://tools.example.com/rpc",
            "protocols": ["jsonrpc"]
        }))
        .unwrap();
        match ws {
            TransportConfig::Websocket { protocols, .. } => {
                assert_eq!(protocols, vec!["jsonrpc"]);
            }
            other => panic!("expected websocket, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_definition_input_schema_wire_name() {
        let tool: ToolDefinition = serde_json::from_value(json!({
            "name": "fetch",
            "description": "Fetch a URL",
            "inputSchema": { "type": "object" }
        }))
        .unwrap();
        assert_eq!(tool.name, "fetch");
        assert_eq!(tool.input_schema["type"], "object");

        let back = serde_json::to_value(&tool).unwrap();
        assert!(back.get("inputSchema").is_some());
    }

    #[test]
    fn test_registered_server_starts_disconnected() {
        let server = RegisteredServer::new(
            "acme",
            "fetcher",
            TransportConfig::Http {
                url: "https://tools.example.com/rpc".to_string(),
                headers: HashMap::new(),
            },
        );
        assert_eq!(server.status, ServerStatus::Disconnected);
        assert!(server.tools.is_none());
        assert!(server.connected_at.is_none());
    }

    #[test]
    fn test_registered_server_persistence_roundtrip() {
        let mut server = RegisteredServer::new(
            "acme",
            "fetcher",
            TransportConfig::Stdio {
                command: "uvx".to_string(),
                args: vec!["mcp-server-fetch".to_string()],
                env: HashMap::new(),
            },
        );
        server.status = ServerStatus::Connected;
        server.tools = Some(vec![ToolDefinition {
            name: "fetch".to_string(),
            description: None,
            input_schema: json!({}),
        }]);

        let json = serde_json::to_string(&server).unwrap();
        let restored: RegisteredServer = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.status, ServerStatus::Connected);
        assert_eq!(restored.tools.unwrap()[0].name, "fetch");
    }
}
