//! Subprocess stdio transport.
//!
//! Launches a child process and frames one JSON value per line: writes to
//! the child's stdin are a JSON value followed by a newline, and each line
//! on the child's stdout is parsed as one JSON value. Standard error is
//! captured and logged, never parsed. The incoming channel closes when the
//! child's stdout reaches EOF.

use std::collections::HashMap;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::{Transport, TransportError};

/// Stdio transport for subprocess tool servers.
pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    /// Spawn the server process and return the transport plus its incoming
    /// message channel.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>), TransportError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Process(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Process("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Process("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Process("failed to capture stderr".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        // Read loop: one JSON value per stdout line. Dropping `tx` on EOF is
        // what signals connection loss to the protocol client.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                if tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "unparseable line from tool server");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdout read error from tool server");
                        break;
                    }
                }
            }
            tracing::debug!("tool server stdout closed");
        });

        // Stderr drain: logged, not parsed.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(stderr = line.as_str(), "tool server stderr");
            }
        });

        Ok((
            Self {
                child: Mutex::new(Some(child)),
                stdin: Mutex::new(Some(stdin)),
            },
            rx,
        ))
    }
}

impl Transport for StdioTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;

        let line = serde_json::to_string(&message)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
