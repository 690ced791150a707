//! Worker process supervisor.
//!
//! Flow:
//! 1. Spawn the worker with piped stdin/stdout/stderr
//! 2. Hand framed stdout/stdin to the bridge loop
//! 3. Drain stderr in the background for the whole lifetime (a full pipe
//!    would otherwise block the worker), forwarding each line to the log
//! 4. Shutdown: close stdin, SIGTERM, bounded wait, SIGKILL

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_BYTES, FrameCodec};
use crate::bridge::protocol::{HostFrame, WorkerFrame};

/// Initial read buffer for worker stdout; grows up to the frame limit.
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default time the worker gets to exit after SIGTERM.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Log target for re-emitted worker stderr.
pub const WORKER_LOG_TARGET: &str = "harbor_bridge::worker";

/// Most recent stderr lines kept for the shutdown report.
pub const STDERR_TAIL_LINES: usize = 1000;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

pub type WorkerReader = FramedRead<ChildStdout, FrameCodec<WorkerFrame>>;
pub type WorkerWriter = FramedWrite<ChildStdin, FrameCodec<HostFrame>>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} not captured")]
    MissingPipe(&'static str),

    #[error("could not find the worker runner. Searched:\n  {searched}")]
    RunnerNotFound { searched: String },
}

/// Program, arguments and extra environment for the worker.
///
/// The worker always inherits the caller's full environment; `env` only adds
/// to it. Session data never goes here, it travels in the `init` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Longest accepted stdout line. Must cover the `done` frame.
    pub max_frame_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// What shutdown observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `None` when the worker was killed by a signal or could not be waited on.
    pub exit_code: Option<i32>,
    /// Whether the grace period ran out and the worker was force-killed.
    pub forced: bool,
    /// The last [`STDERR_TAIL_LINES`] non-blank stderr lines, in order.
    pub stderr: Vec<String>,
}

/// A running worker. Owns the child handle and its streams.
pub struct WorkerProcess {
    child: Child,
    reader: WorkerReader,
    writer: Option<WorkerWriter>,
    stderr_drain: Option<JoinHandle<()>>,
    stderr_lines: StderrTail,
}

impl WorkerProcess {
    /// Spawn the worker with all three stdio streams piped.
    pub fn spawn(command: &WorkerCommand, config: &SupervisorConfig) -> Result<Self, SpawnError> {
        tracing::info!(command = %command, "Spawning worker");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Launch {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        tracing::debug!(
            pid = child.id(),
            max_frame_bytes = config.max_frame_bytes,
            "Worker spawned"
        );

        let reader = FramedRead::with_capacity(
            stdout,
            FrameCodec::with_max_frame_bytes(config.max_frame_bytes),
            READ_BUFFER_CAPACITY,
        );
        let writer = FramedWrite::new(
            stdin,
            FrameCodec::with_max_frame_bytes(config.max_frame_bytes),
        );

        let stderr_lines = StderrTail::default();
        let stderr_drain = tokio::spawn(drain_stderr(
            stderr,
            Arc::clone(&stderr_lines),
            STDERR_TAIL_LINES,
        ));

        Ok(Self {
            child,
            reader,
            writer: Some(writer),
            stderr_drain: Some(stderr_drain),
            stderr_lines,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Framed stdout/stdin for the bridge loop.
    ///
    /// Returns `None` once shutdown has begun and stdin is closed.
    pub fn streams(&mut self) -> Option<(&mut WorkerReader, &mut WorkerWriter)> {
        let writer = self.writer.as_mut()?;
        Some((&mut self.reader, writer))
    }

    /// Wait up to `limit` for the worker to exit on its own.
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<i32> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                tracing::warn!(
                    wait_secs = limit.as_secs_f64(),
                    "Worker closed stdout but is still running"
                );
                None
            }
        }
    }

    /// Terminate the worker and collect the tail of its stderr.
    ///
    /// Stderr is drained to the end whichever way the process ended.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        // EOF on stdin is the polite signal; many runners exit on it alone.
        drop(self.writer.take());

        let mut forced = false;
        let exit_code = match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            Ok(None) | Err(_) => {
                self.terminate();
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to wait for worker after SIGTERM");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = grace.as_secs_f64(),
                            "Worker did not exit within grace period, killing"
                        );
                        forced = true;
                        if let Err(e) = self.child.kill().await {
                            tracing::warn!(error = %e, "Failed to kill worker");
                        }
                        self.child.wait().await.ok().and_then(|s| s.code())
                    }
                }
            }
        };

        // A grandchild may still hold stderr open; don't wait on it forever.
        if let Some(mut handle) = self.stderr_drain.take()
            && tokio::time::timeout(grace, &mut handle).await.is_err()
        {
            tracing::warn!("Worker stderr still open after exit, keeping lines read so far");
            handle.abort();
        }
        let stderr: Vec<String> = match self.stderr_lines.lock() {
            Ok(mut lines) => lines.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        tracing::debug!(exit_code, forced, stderr_lines = stderr.len(), "Worker shut down");

        ShutdownReport {
            exit_code,
            forced,
            stderr,
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            tracing::warn!(pid, "Worker pid out of range, killing instead");
            let _ = self.child.start_kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM failed (already exited?)");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Failed to signal worker (already exited?)");
        }
    }
}

/// Read stderr to EOF, logging every non-blank line as it arrives and keeping
/// the last `tail` of them. Invalid UTF-8 is replaced.
async fn drain_stderr<R>(stderr: R, sink: StderrTail, tail: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                tracing::info!(target: WORKER_LOG_TARGET, "{}", line);
                if let Ok(mut lines) = sink.lock() {
                    lines.push_back(line.to_string());
                    if lines.len() > tail {
                        lines.pop_front();
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading worker stderr");
                break;
            }
        }
    }
}
