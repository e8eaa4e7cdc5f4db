//! Shell/container command node executor.
//!
//! Resolves templates in the command, environment values, and working
//! directory, then issues one execute request to the command collaborator.
//! A non-zero exit code is a successful execution with a non-zero status;
//! only transport errors and collaborator-reported failures are errors
//! (and retry, up to 2 attempts).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use flowline_types::exec::{ExecError, ExecRequest};
use flowline_types::workflow::{NodeConfig, NodeDefinition, NodeKind};

use crate::exec::CommandRunner;
use crate::workflow::context::RunContext;
use crate::workflow::node_executor::{ExecutionError, NodeExecutor, NodeOutput};
use crate::workflow::resolver;

/// Executes `tool` nodes against the command collaborator.
pub struct ToolNodeExecutor<R: CommandRunner> {
    runner: Arc<R>,
}

impl<R: CommandRunner> ToolNodeExecutor<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> NodeExecutor for ToolNodeExecutor<R> {
    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    fn max_attempts(&self) -> u32 {
        2
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> Result<NodeOutput, ExecutionError> {
        let NodeConfig::Tool(cfg) = &node.config else {
            return Err(ExecutionError::Executor(format!(
                "node '{}' is not a tool node",
                node.id
            )));
        };

        let env: HashMap<String, String> = cfg
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolver::resolve_str(v, ctx)))
            .collect();

        let request = ExecRequest {
            executor: cfg.executor.clone(),
            command: resolver::resolve_str(&cfg.command, ctx),
            working_dir: cfg.working_dir.as_deref().map(|d| resolver::resolve_str(d, ctx)),
            env,
            timeout_secs: cfg.timeout_secs,
            image: cfg.image.clone(),
        };

        tracing::debug!(
            node_id = node.id.as_str(),
            executor = request.executor.as_str(),
            "dispatching command"
        );

        let result = self.runner.execute(&request).await.map_err(|e| match e {
            ExecError::Transport(msg) => ExecutionError::Transport(msg),
            ExecError::Runner(msg) => ExecutionError::Executor(msg),
        })?;

        let metadata = json!({ "executor": request.executor });
        let output = serde_json::to_value(&result)
            .map_err(|e| ExecutionError::Executor(format!("unserializable result: {e}")))?;

        Ok(NodeOutput::with_metadata(output, metadata))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::exec::ExecResult;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingRunner {
        seen: Mutex<Vec<ExecRequest>>,
        exit_code: i32,
    }

    impl CommandRunner for RecordingRunner {
        async fn execute(&self, request: &ExecRequest) -> Result<ExecResult, ExecError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(ExecResult {
                exit_code: self.exit_code,
                stdout: "captured".to_string(),
                stderr: String::new(),
                duration_ms: 12,
            })
        }
    }

    fn tool_node(command: &str) -> NodeDefinition {
        serde_json::from_value(json!({
            "id": "run-it",
            "type": "tool",
            "config": {
                "command": command,
                "env": { "TOPIC": "${outputs.gather.text}" },
                "working_dir": "/work/${outputs.gather.text}"
            }
        }))
        .unwrap()
    }

    fn ctx_with_gather() -> RunContext {
        let mut ctx = RunContext::new(Uuid::now_v7(), "acme", HashMap::new());
        ctx.set_output("gather", json!({ "text": "news" }));
        ctx
    }

    #[tokio::test]
    async fn resolves_command_env_and_working_dir() {
        let runner = Arc::new(RecordingRunner {
            seen: Mutex::new(vec![]),
            exit_code: 0,
        });
        let executor = ToolNodeExecutor::new(Arc::clone(&runner));

        let node = tool_node("echo ${outputs.gather.text}");
        executor.execute(&node, &ctx_with_gather()).await.unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].command, "echo news");
        assert_eq!(seen[0].env["TOPIC"], "news");
        assert_eq!(seen[0].working_dir.as_deref(), Some("/work/news"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_success() {
        let runner = Arc::new(RecordingRunner {
            seen: Mutex::new(vec![]),
            exit_code: 3,
        });
        let executor = ToolNodeExecutor::new(runner);

        let output = executor
            .execute(&tool_node("false"), &ctx_with_gather())
            .await
            .unwrap();
        assert_eq!(output.output["exitCode"], 3);
        assert_eq!(output.output["stdout"], "captured");
        assert_eq!(output.output["duration"], 12);
    }

    #[tokio::test]
    async fn transport_error_surfaces_as_transport() {
        struct DownRunner;
        impl CommandRunner for DownRunner {
            async fn execute(&self, _request: &ExecRequest) -> Result<ExecResult, ExecError> {
                Err(ExecError::Transport("connection refused".to_string()))
            }
        }

        let executor = ToolNodeExecutor::new(Arc::new(DownRunner));
        let err = executor
            .execute(&tool_node("true"), &ctx_with_gather())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Transport(_)));
    }

    #[test]
    fn declares_two_attempts() {
        let executor = ToolNodeExecutor::new(Arc::new(RecordingRunner {
            seen: Mutex::new(vec![]),
            exit_code: 0,
        }));
        assert_eq!(NodeExecutor::max_attempts(&executor), 2);
        assert_eq!(NodeExecutor::kind(&executor), NodeKind::Tool);
    }
}
