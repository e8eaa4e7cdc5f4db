//! Workflow domain types for Flowline.
//!
//! Defines the canonical representation for DAG workflows: the immutable
//! `Workflow` definition with its typed `NodeConfig` payloads, plus the
//! execution tracking types (`Run`, `RunNode`) persisted per execution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::llm::ChatMessage;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// An immutable workflow definition.
///
/// The node list order is informational only; scheduling obeys the DAG
/// induced by each node's `dependencies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Declared input schema, keyed by input name.
    #[serde(default)]
    pub inputs: HashMap<String, InputSpec>,
    /// Workflow-level variables seeded into every run's context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vars: HashMap<String, Value>,
    /// The nodes forming the workflow DAG.
    pub nodes: Vec<NodeDefinition>,
    /// Optional explicit edge list (visual builders). Dependency edges on the
    /// nodes themselves are authoritative for scheduling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeDefinition>,
}

impl Workflow {
    /// Look up a node by its ID.
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Declared schema for a single workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// JSON type name ("string", "number", "boolean", "object", "array").
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// An explicit edge between two nodes (visual builder metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Node definition
// ---------------------------------------------------------------------------

/// A single node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// User-defined node ID (e.g. "gather-news"). Unique within a workflow.
    pub id: String,
    /// Kind discriminator plus the kind-specific configuration payload.
    /// Serialized as sibling `type` and `config` keys.
    #[serde(flatten)]
    pub config: NodeConfig,
    /// Node IDs this node depends on (DAG edges, dependency -> this node).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional per-node retry override (attempts, inclusive of the first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl NodeDefinition {
    /// The kind of this node.
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

/// The kind of node in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Llm,
    Tool,
    Human,
    Mcp,
}

impl NodeKind {
    /// Stable string form, matching the wire `type` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Llm => "llm",
            NodeKind::Tool => "tool",
            NodeKind::Human => "human",
            NodeKind::Mcp => "mcp",
        }
    }
}

/// Node-kind-specific configuration payload.
///
/// Adjacently tagged so that the wire shape is a `type` discriminator next to
/// a `config` object:
/// ```json
/// { "id": "summarize", "type": "llm", "config": { "model": "...", "messages": [...] } }
/// ```
/// Parsing happens at definition load time, so executors receive typed
/// configuration rather than re-validating free-form JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Chat-complete a model via the LLM gateway.
    Llm(LlmNodeConfig),
    /// Run a shell/container command via the command executor.
    Tool(ToolNodeConfig),
    /// Pause for human approval.
    Human(HumanNodeConfig),
    /// Call a tool on a registered tool server.
    Mcp(McpNodeConfig),
}

impl NodeConfig {
    /// The kind discriminator for this configuration.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Llm(_) => NodeKind::Llm,
            NodeConfig::Tool(_) => NodeKind::Tool,
            NodeConfig::Human(_) => NodeKind::Human,
            NodeConfig::Mcp(_) => NodeKind::Mcp,
        }
    }
}

/// Configuration for an LLM node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmNodeConfig {
    pub model: String,
    /// Message contents may contain `${...}` templates resolved at execution.
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Configuration for a shell/container command node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNodeConfig {
    /// Which executor backend to use (e.g. "shell", "docker").
    #[serde(default = "default_executor")]
    pub executor: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Command timeout in seconds, enforced by the executor backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Container image, when the executor is container-backed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_executor() -> String {
    "shell".to_string()
}

/// Configuration for a human approval node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanNodeConfig {
    /// Prompt shown to the approver. May contain `${...}` templates.
    pub prompt: String,
    /// Users allowed to resolve the approval (empty = anyone).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    /// Approval timeout in seconds (default 3600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Configuration for a tool-server call node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpNodeConfig {
    /// Explicit server to call. When absent, the tool is located by name
    /// across the tenant's connected servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Uuid>,
    pub tool: String,
    /// Tool arguments. Values may contain `${...}` templates.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub arguments: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Run status lattices
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
///
/// Transitions are monotonic: `Queued -> Running -> {Waiting <-> Running}
/// -> {Completed | Failed | Cancelled}`. Terminal statuses are never
/// overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of an individual node execution within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunNodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: Uuid,
    /// Tenant that owns this run.
    pub tenant_id: String,
    /// Current run status.
    pub status: RunStatus,
    /// The input map used to seed the run's variables.
    pub inputs: HashMap<String, Value>,
    /// Aggregated node outputs, written when the run reaches a terminal
    /// status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Terminal error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started executing.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// When the run record was created.
    pub created_at: DateTime<Utc>,
}

/// Persisted execution record for one `(run, node)` pair.
///
/// Created lazily on the node's first terminal transition; one row per
/// `(run_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNode {
    /// UUIDv7 record ID.
    pub id: Uuid,
    /// Parent run ID.
    pub run_id: Uuid,
    /// Node ID matching `NodeDefinition.id`.
    pub node_id: String,
    /// The node's kind, denormalized for querying.
    pub kind: NodeKind,
    /// Current node status.
    pub status: RunNodeStatus,
    /// JSON output produced by the node, if completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if the node failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries consumed (0 = succeeded or failed first try).
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Node-state delta handed to the persistence hook after a terminal
/// transition.
#[derive(Debug, Clone)]
pub struct RunNodeUpdate {
    pub node_id: String,
    pub kind: NodeKind,
    pub status: RunNodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
