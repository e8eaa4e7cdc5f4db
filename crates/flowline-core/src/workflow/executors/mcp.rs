//! Tool-server call node executor.
//!
//! Resolves templates in the arguments map, then asks the connection
//! manager to call a tool, either on an explicitly configured server or by
//! name-based auto-discovery across the tenant's connected servers. The
//! tool-call response (content list plus isError flag) is returned
//! verbatim as the node output. Does not retry; callers wanting retry
//! configure the node's `retries` override.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use flowline_types::workflow::{NodeConfig, NodeDefinition, NodeKind};

use crate::mcp::{ManagerError, RpcError, ServerManager};
use crate::repository::ServerRepository;
use crate::workflow::context::RunContext;
use crate::workflow::node_executor::{ExecutionError, NodeExecutor, NodeOutput};
use crate::workflow::resolver;

/// Executes `mcp` nodes against the connection manager.
pub struct McpNodeExecutor<R: ServerRepository> {
    manager: Arc<ServerManager<R>>,
}

impl<R: ServerRepository + 'static> McpNodeExecutor<R> {
    pub fn new(manager: Arc<ServerManager<R>>) -> Self {
        Self { manager }
    }
}

/// Convert manager failures into the executor error taxonomy: JSON-RPC
/// error replies surface as protocol errors, connection trouble as
/// transport errors, everything else as plain execution failures.
fn map_manager_error(err: ManagerError) -> ExecutionError {
    match err {
        ManagerError::Rpc(RpcError::Remote { code, message, .. }) => {
            ExecutionError::Protocol { code, message }
        }
        ManagerError::Rpc(inner @ (RpcError::Timeout { .. } | RpcError::ConnectionClosed)) => {
            ExecutionError::Transport(inner.to_string())
        }
        ManagerError::Transport(inner) => ExecutionError::Transport(inner.to_string()),
        other => ExecutionError::Executor(other.to_string()),
    }
}

impl<R: ServerRepository + 'static> NodeExecutor for McpNodeExecutor<R> {
    fn kind(&self) -> NodeKind {
        NodeKind::Mcp
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> Result<NodeOutput, ExecutionError> {
        let NodeConfig::Mcp(cfg) = &node.config else {
            return Err(ExecutionError::Executor(format!(
                "node '{}' is not an mcp node",
                node.id
            )));
        };

        let arguments: Map<String, Value> = cfg
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), resolver::resolve_value(v, ctx)))
            .collect();

        let server_id = match cfg.server_id {
            Some(id) => id,
            None => {
                self.manager
                    .find_tool(&cfg.tool, Some(&ctx.tenant_id))
                    .map(|(id, _)| id)
                    .ok_or_else(|| {
                        ExecutionError::Executor(format!(
                            "tool '{}' not found on any connected server",
                            cfg.tool
                        ))
                    })?
            }
        };

        tracing::debug!(
            node_id = node.id.as_str(),
            server_id = %server_id,
            tool = cfg.tool.as_str(),
            "calling tool"
        );

        let result = self
            .manager
            .call_tool(server_id, &cfg.tool, Value::Object(arguments))
            .await
            .map_err(map_manager_error)?;

        let metadata = json!({ "serverId": server_id, "tool": cfg.tool });
        let output = serde_json::to_value(&result)
            .map_err(|e| ExecutionError::Executor(format!("unserializable result: {e}")))?;

        Ok(NodeOutput::with_metadata(output, metadata))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
