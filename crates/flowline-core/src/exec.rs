//! Shell/container command collaborator trait.
//!
//! The command executor service (sandboxing, container lifecycle, output
//! capture) lives outside the core. The tool node executor hands it a
//! command descriptor and receives exit code plus captured output.

use flowline_types::exec::{ExecError, ExecRequest, ExecResult};

/// Command execution collaborator consumed by the tool node executor.
pub trait CommandRunner: Send + Sync {
    /// Execute one command and return its outcome. A non-zero exit code is
    /// a successful execution, not an `Err`.
    fn execute(
        &self,
        request: &ExecRequest,
    ) -> impl std::future::Future<Output = Result<ExecResult, ExecError>> + Send;
}
