//! Single choke point for running external networking tools.
//!
//! Every backend and diagnostics call goes through a [`CommandExecutor`], so
//! call sites can be exercised against a scripted fake instead of the host's
//! real `nmcli`, `wpa_cli` or `ping`.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, WifiError};

/// Captured result of one external command.
///
/// A non-zero exit status is not an error at this layer; callers inspect
/// [`CommandOutput::success`] and decide what the tool's output means.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error text reported by the tool, preferring stderr over stdout.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `program` with `args`, killing it if it outlives `timeout`.
    ///
    /// Fails only with [`WifiError::ExecutionTimeout`],
    /// [`WifiError::ExecutableNotFound`] or [`WifiError::Spawn`].
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        // Arguments may carry a passphrase, so only their count is logged.
        tracing::debug!(program, args = args.len(), ?timeout, "Running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                tracing::warn!(program, ?timeout, "Command timed out");
                return Err(WifiError::ExecutionTimeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WifiError::ExecutableNotFound(program.to_string()));
            }
            Ok(Err(source)) => {
                return Err(WifiError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Ok(Ok(output)) => output,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if !result.success() {
            tracing::debug!(program, exit_code = ?result.exit_code, "Command exited unsuccessfully");
        }

        Ok(result)
    }
}
