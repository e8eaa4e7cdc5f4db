//! Node executor contract, registry, and retry wrapper.
//!
//! One executor exists per node kind. The trait uses RPITIT; the object-safe
//! `NodeExecutorDyn` counterpart with boxed futures (same blanket-impl
//! pattern as the type-erased collaborator wrappers) lets the registry hold
//! executors behind dynamic dispatch.
//!
//! The registry also owns the retry policy: a failed attempt is retried with
//! exponential backoff (`2^attempt` seconds) up to the executor's
//! `max_attempts`, and every attempt runs under the per-node timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use flowline_types::workflow::{NodeDefinition, NodeKind};

use super::context::RunContext;

// ---------------------------------------------------------------------------
// Output and error types
// ---------------------------------------------------------------------------

/// The result of a successful node execution.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    /// The node's output value, stored in the run context under the node ID.
    pub output: Value,
    /// Executor-specific metadata (token usage, durations, server IDs).
    pub metadata: Value,
}

impl NodeOutput {
    /// An output with no metadata.
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(output: Value, metadata: Value) -> Self {
        Self { output, metadata }
    }
}

/// Errors from node execution. Recorded on the run-node row; downstream
/// nodes whose dependencies failed never become runnable.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No executor is registered for the node's kind.
    #[error("no executor registered for node kind '{0}'")]
    MissingExecutor(String),

    /// The executor's external call failed (after retries, at the caller).
    #[error("{0}")]
    Executor(String),

    /// A single attempt exceeded the per-node timeout.
    #[error("node execution timed out after {0} s")]
    Timeout(u64),

    /// A human node was rejected.
    #[error("Approval rejected by {approver}: {comment}")]
    ApprovalRejected { approver: String, comment: String },

    /// A human node's approval wait timed out.
    #[error("Approval timeout")]
    ApprovalTimeout,

    /// A human node's approval wait was cancelled.
    #[error("Approval cancelled")]
    ApprovalCancelled,

    /// A tool server answered with a JSON-RPC error.
    #[error("tool server error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// The connection to a collaborator dropped or was refused.
    #[error("transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// A node executor for one node kind.
///
/// Executors never mutate the context; the workflow executor records the
/// output on the completion path.
pub trait NodeExecutor: Send + Sync {
    /// The node kind this executor handles.
    fn kind(&self) -> NodeKind;

    /// Maximum attempts, inclusive of the first.
    fn max_attempts(&self) -> u32 {
        1
    }

    /// Execute the node against a context snapshot.
    fn execute(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> impl Future<Output = Result<NodeOutput, ExecutionError>> + Send;
}

/// Object-safe version of [`NodeExecutor`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch in the registry; a blanket
/// implementation covers every `NodeExecutor`.
pub trait NodeExecutorDyn: Send + Sync {
    fn kind(&self) -> NodeKind;

    fn max_attempts(&self) -> u32;

    fn execute_boxed<'a>(
        &'a self,
        node: &'a NodeDefinition,
        ctx: &'a RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, ExecutionError>> + Send + 'a>>;
}

impl<T: NodeExecutor> NodeExecutorDyn for T {
    fn kind(&self) -> NodeKind {
        NodeExecutor::kind(self)
    }

    fn max_attempts(&self) -> u32 {
        NodeExecutor::max_attempts(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        node: &'a NodeDefinition,
        ctx: &'a RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(self.execute(node, ctx))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Outcome of a node execution through the registry, including how many
/// retries were consumed.
pub struct AttemptedExecution {
    pub result: Result<NodeOutput, ExecutionError>,
    /// Retries consumed (0 = resolved on the first attempt).
    pub retries: u32,
}

/// Selects the executor for a node by its kind and wraps execution with the
/// retry/timeout policy.
pub struct NodeExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutorDyn>>,
}

impl NodeExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its kind, replacing any previous one.
    pub fn register<E: NodeExecutor + 'static>(&mut self, executor: E) {
        self.executors
            .insert(NodeExecutor::kind(&executor), Arc::new(executor));
    }

    /// Look up the executor for a kind.
    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutorDyn>> {
        self.executors.get(&kind).cloned()
    }

    /// Execute a node with retry and per-attempt timeout.
    ///
    /// Attempts are bounded by the node's `retries` override when present,
    /// otherwise the executor's `max_attempts`. On exhaustion the last
    /// error is returned. Human nodes own their approval timeout, so the
    /// outer per-attempt timeout is not applied to them.
    pub async fn execute_with_retry(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
        node_timeout: Duration,
    ) -> AttemptedExecution {
        let kind = node.kind();
        let Some(executor) = self.get(kind) else {
            return AttemptedExecution {
                result: Err(ExecutionError::MissingExecutor(kind.as_str().to_string())),
                retries: 0,
            };
        };

        let max_attempts = node.retries.unwrap_or_else(|| executor.max_attempts()).max(1);
        let mut attempt = 1u32;

        loop {
            let result = if kind == NodeKind::Human {
                executor.execute_boxed(node, ctx).await
            } else {
                match tokio::time::timeout(node_timeout, executor.execute_boxed(node, ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Timeout(node_timeout.as_secs())),
                }
            };

            match result {
                Ok(output) => {
                    return AttemptedExecution {
                        result: Ok(output),
                        retries: attempt - 1,
                    };
                }
                Err(err) if attempt < max_attempts => {
                    let backoff = Duration::from_secs(1 << attempt.min(16));
                    tracing::warn!(
                        node_id = node.id.as_str(),
                        attempt,
                        max_attempts,
                        backoff_secs = backoff.as_secs(),
                        error = %err,
                        "node attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    return AttemptedExecution {
                        result: Err(err),
                        retries: attempt - 1,
                    };
                }
            }
        }
    }
}

impl Default for NodeExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Test executor that fails a configurable number of times before
    /// succeeding.
    struct FlakyExecutor {
        kind: NodeKind,
        failures_before_success: u32,
        max_attempts: u32,
        calls: AtomicU32,
    }

    impl NodeExecutor for FlakyExecutor {
        fn kind(&self) -> NodeKind {
            self.kind
        }

        fn max_attempts(&self) -> u32 {
            self.max_attempts
        }

        async fn execute(
            &self,
            _node: &NodeDefinition,
            _ctx: &RunContext,
        ) -> Result<NodeOutput, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(ExecutionError::Executor(format!("boom {call}")))
            } else {
                Ok(NodeOutput::new(json!({ "ok": true })))
            }
        }
    }

    fn tool_node(id: &str) -> NodeDefinition {
        serde_json::from_value(json!({
            "id": id,
            "type": "tool",
            "config": { "command": "true" }
        }))
        .unwrap()
    }

    fn test_ctx() -> RunContext {
        RunContext::new(Uuid::now_v7(), "acme", HashMap::new())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_counts_retries() {
        let mut registry = NodeExecutorRegistry::new();
        registry.register(FlakyExecutor {
            kind: NodeKind::Tool,
            failures_before_success: 2,
            max_attempts: 3,
            calls: AtomicU32::new(0),
        });

        let attempted = registry
            .execute_with_retry(&tool_node("t"), &test_ctx(), Duration::from_secs(300))
            .await;

        assert!(attempted.result.is_ok());
        assert_eq!(attempted.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let mut registry = NodeExecutorRegistry::new();
        registry.register(FlakyExecutor {
            kind: NodeKind::Tool,
            failures_before_success: 10,
            max_attempts: 2,
            calls: AtomicU32::new(0),
        });

        let attempted = registry
            .execute_with_retry(&tool_node("t"), &test_ctx(), Duration::from_secs(300))
            .await;

        match attempted.result {
            Err(ExecutionError::Executor(msg)) => assert_eq!(msg, "boom 1"),
            other => panic!("expected last error, got {other:?}"),
        }
        assert_eq!(attempted.retries, 1);
    }

    #[tokio::test]
    async fn missing_executor_fails_without_retry() {
        let registry = NodeExecutorRegistry::new();
        let attempted = registry
            .execute_with_retry(&tool_node("t"), &test_ctx(), Duration::from_secs(300))
            .await;

        assert!(matches!(
            attempted.result,
            Err(ExecutionError::MissingExecutor(ref kind)) if kind == "tool"
        ));
        assert_eq!(attempted.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn node_retries_override_wins_over_executor_default() {
        let mut registry = NodeExecutorRegistry::new();
        registry.register(FlakyExecutor {
            kind: NodeKind::Tool,
            failures_before_success: 3,
            max_attempts: 2,
            calls: AtomicU32::new(0),
        });

        let mut node = tool_node("t");
        node.retries = Some(4);

        let attempted = registry
            .execute_with_retry(&node, &test_ctx(), Duration::from_secs(300))
            .await;
        assert!(attempted.result.is_ok());
        assert_eq!(attempted.retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_an_error() {
        struct SlowExecutor;
        impl NodeExecutor for SlowExecutor {
            fn kind(&self) -> NodeKind {
                NodeKind::Tool
            }
            async fn execute(
                &self,
                _node: &NodeDefinition,
                _ctx: &RunContext,
            ) -> Result<NodeOutput, ExecutionError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(NodeOutput::new(json!(null)))
            }
        }

        let mut registry = NodeExecutorRegistry::new();
        registry.register(SlowExecutor);

        let attempted = registry
            .execute_with_retry(&tool_node("t"), &test_ctx(), Duration::from_secs(5))
            .await;
        assert!(matches!(attempted.result, Err(ExecutionError::Timeout(5))));
    }

    #[test]
    fn execution_error_messages() {
        assert_eq!(ExecutionError::ApprovalTimeout.to_string(), "Approval timeout");
        assert_eq!(
            ExecutionError::ApprovalCancelled.to_string(),
            "Approval cancelled"
        );
        let err = ExecutionError::ApprovalRejected {
            approver: "bob".to_string(),
            comment: "no".to_string(),
        };
        assert!(err.to_string().contains("bob"));
    }
}
