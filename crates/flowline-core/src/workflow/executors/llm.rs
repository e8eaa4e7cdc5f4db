//! LLM node executor.
//!
//! Resolves templates inside every message content, issues one completion
//! request to the LLM gateway, and returns the gateway's response verbatim
//! as the node output. Transport failures and provider error responses both
//! retry (up to 3 attempts).

use std::sync::Arc;

use serde_json::json;

use flowline_types::llm::{ChatMessage, CompletionRequest};
use flowline_types::workflow::{NodeConfig, NodeDefinition, NodeKind};

use crate::llm::LlmClient;
use crate::workflow::context::RunContext;
use crate::workflow::node_executor::{ExecutionError, NodeExecutor, NodeOutput};
use crate::workflow::resolver;

/// Executes `llm` nodes against the gateway collaborator.
pub struct LlmNodeExecutor<C: LlmClient> {
    client: Arc<C>,
}

impl<C: LlmClient> LlmNodeExecutor<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

impl<C: LlmClient> NodeExecutor for LlmNodeExecutor<C> {
    fn kind(&self) -> NodeKind {
        NodeKind::Llm
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> Result<NodeOutput, ExecutionError> {
        let NodeConfig::Llm(cfg) = &node.config else {
            return Err(ExecutionError::Executor(format!(
                "node '{}' is not an llm node",
                node.id
            )));
        };

        let messages: Vec<ChatMessage> = cfg
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: resolver::resolve_str(&m.content, ctx),
            })
            .collect();

        let request = CompletionRequest {
            model: cfg.model.clone(),
            messages,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            tools: None,
        };

        tracing::debug!(
            node_id = node.id.as_str(),
            model = cfg.model.as_str(),
            "dispatching completion request"
        );

        let response = self
            .client
            .complete(&request)
            .await
            .map_err(|e| ExecutionError::Executor(e.to_string()))?;

        let metadata = json!({ "usage": response.usage, "model": response.model });
        let output = serde_json::to_value(&response)
            .map_err(|e| ExecutionError::Executor(format!("unserializable response: {e}")))?;

        Ok(NodeOutput::with_metadata(output, metadata))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::llm::{CompletionResponse, LlmError, Usage};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Stub gateway that records the request and echoes the last message.
    struct EchoClient {
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl LlmClient for EchoClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(CompletionResponse {
                id: "cmpl-1".to_string(),
                model: request.model.clone(),
                content: request.messages.last().unwrap().content.clone(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                finish_reason: "stop".to_string(),
            })
        }
    }

    fn llm_node(content: &str) -> NodeDefinition {
        serde_json::from_value(json!({
            "id": "ask",
            "type": "llm",
            "config": {
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": content }]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_templates_in_message_content() {
        let client = Arc::new(EchoClient {
            seen: Mutex::new(vec![]),
        });
        let executor = LlmNodeExecutor::new(Arc::clone(&client));

        let mut ctx = RunContext::new(Uuid::now_v7(), "acme", HashMap::new());
        ctx.set_output("gather", json!({ "text": "hello" }));

        let node = llm_node("Summarize: ${outputs.gather.text}");
        let output = executor.execute(&node, &ctx).await.unwrap();

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].content, "Summarize: hello");
        assert_eq!(output.output["content"], "Summarize: hello");
        assert_eq!(output.metadata["usage"]["input_tokens"], 10);
    }

    #[tokio::test]
    async fn gateway_error_becomes_execution_error() {
        struct FailingClient;
        impl LlmClient for FailingClient {
            async fn complete(
                &self,
                _request: &CompletionRequest,
            ) -> Result<CompletionResponse, LlmError> {
                Err(LlmError::Provider("model overloaded".to_string()))
            }
        }

        let executor = LlmNodeExecutor::new(Arc::new(FailingClient));
        let ctx = RunContext::new(Uuid::now_v7(), "acme", HashMap::new());

        let err = executor.execute(&llm_node("hi"), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    #[test]
    fn declares_three_attempts() {
        let executor = LlmNodeExecutor::new(Arc::new(EchoClient {
            seen: Mutex::new(vec![]),
        }));
        assert_eq!(NodeExecutor::max_attempts(&executor), 3);
        assert_eq!(NodeExecutor::kind(&executor), NodeKind::Llm);
    }
}
