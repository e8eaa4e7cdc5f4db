//! LLM gateway collaborator trait.
//!
//! The gateway (provider selection, auth, rate limiting) lives outside the
//! core. The executor only needs a single chat-completion call.
//!
//! Uses native async fn in traits (RPITIT, Rust 2024 edition).

use flowline_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Chat-completion collaborator consumed by the LLM node executor.
pub trait LlmClient: Send + Sync {
    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
