//! Request/response types for the LLM gateway collaborator.
//!
//! The gateway itself lives outside the core; the executor only needs the
//! chat-completion surface defined here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", or "assistant".
    pub role: String,
    pub content: String,
}

/// A chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tool definitions forwarded to the provider, when tool use is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A chat-completion response, returned verbatim as the node output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Errors from the LLM gateway. All variants are retryable: transport
/// failures and well-formed provider error responses alike.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm provider error: {0}")]
    Provider(String),

    #[error("invalid llm response: {0}")]
    InvalidResponse(String),
}
