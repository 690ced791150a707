//! Sandbox collaborator: where proxied shell commands actually run.
//!
//! The bridge only needs `exec(command) -> {stdout, stderr, exit_code}`. A
//! failing command is a successful exec with a non-zero exit code; an `Err`
//! means the sandbox itself could not run anything.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Default per-command timeout for [`LocalShell`].
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code reported for commands killed by the timeout (matches coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to launch command: {0}")]
    Launch(#[source] std::io::Error),

    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Command-execution backend that `exec_request`s are proxied to.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SandboxError>;
}

/// Runs commands with `sh -c` on the host.
#[derive(Debug, Clone)]
pub struct LocalShell {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalShell {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sandbox for LocalShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SandboxError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(SandboxError::Launch)?,
            Err(_) => {
                tracing::warn!(
                    command,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Command timed out"
                );
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!("command timed out after {:.1}s", self.timeout.as_secs_f64()),
                    exit_code: TIMEOUT_EXIT_CODE,
                });
            }
        };

        // Killed by a signal: no exit code.
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}
