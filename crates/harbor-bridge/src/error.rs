use thiserror::Error;

use crate::bridge::codec::{CodecError, FrameError};
use crate::bridge::protocol::RequestId;
use crate::config::ConfigError;
use crate::sandbox::SandboxError;
use crate::supervisor::SpawnError;
use crate::trajectory::TrajectoryError;

/// Everything that can end (or be skipped during) a bridge session.
///
/// `MalformedFrame`, `UnknownFrameKind` and `InvalidRequest` are recoverable:
/// the bridge logs them and keeps reading. Every other variant is fatal for
/// the session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("malformed frame ({reason}): {snippet}")]
    MalformedFrame { reason: String, snippet: String },

    #[error("unknown frame kind `{kind}`")]
    UnknownFrameKind { kind: String },

    #[error("invalid {kind} `{id}`: {reason}")]
    InvalidRequest {
        kind: String,
        id: RequestId,
        reason: String,
    },

    #[error("worker exited unexpectedly with code {}", exit_label(.code))]
    UnexpectedExit { code: Option<i32> },

    #[error("worker reported error: {message}{}", stack_suffix(.stack))]
    WorkerReportedError {
        message: String,
        stack: Option<String>,
    },

    #[error("sandbox failed to run `{command}`: {source}")]
    ProxyFailure {
        command: String,
        #[source]
        source: SandboxError,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error("session cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Whether the bridge loop may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. }
                | Self::UnknownFrameKind { .. }
                | Self::InvalidRequest { .. }
        )
    }
}

impl From<FrameError> for BridgeError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Malformed { reason, snippet } => Self::MalformedFrame { reason, snippet },
            FrameError::UnknownKind { kind } => Self::UnknownFrameKind { kind },
            FrameError::InvalidRequest { kind, id, reason } => {
                Self::InvalidRequest { kind, id, reason }
            }
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown (killed by signal?)".to_string(), |c| c.to_string())
}

fn stack_suffix(stack: &Option<String>) -> String {
    match stack {
        Some(stack) if !stack.trim().is_empty() => format!("\n{stack}"),
        _ => String::new(),
    }
}
