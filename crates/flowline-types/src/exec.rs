//! Request/response types for the shell/container command collaborator.
//!
//! The command executor is an external service: the core hands it a command
//! descriptor and receives exit code plus captured output. A non-zero exit
//! code is a successful execution with a non-zero status, not an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Executor backend ("shell", "docker", ...).
    pub executor: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Command timeout in seconds, enforced by the executor backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Container image, for container-backed executors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The outcome of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

/// Errors from the command executor collaborator. These are retryable;
/// a command that ran and exited non-zero is not an error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executor transport error: {0}")]
    Transport(String),

    #[error("executor failure: {0}")]
    Runner(String),
}
