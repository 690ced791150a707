//! harbor-bridge: drive an agent worker process over newline-delimited JSON,
//! proxy its shell commands into a sandbox, and record the run as a trajectory.

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod runner;
pub mod sandbox;
pub mod sanitize;
pub mod session;
pub mod supervisor;
pub mod system_prompt;
pub mod telemetry;
pub mod trajectory;

/// Crate version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use tokio_util::sync::CancellationToken;

pub use bridge::protocol::{HostFrame, RawMessage, RequestId, Role, WorkerFrame};
pub use bridge::{BridgeLoop, BridgeState};
pub use config::{BridgeConfig, ConfigError, load_trial_config};
pub use error::BridgeError;
pub use lookup::ExampleLookup;
pub use sandbox::{ExecOutput, LocalShell, Sandbox, SandboxError};
pub use sanitize::sanitize;
pub use session::{SessionOutcome, SessionRequest, SessionRunner, run_session};
pub use supervisor::{ShutdownReport, SpawnError, SupervisorConfig, WorkerCommand, WorkerProcess};
pub use telemetry::{LogTraceSink, NoopTraceSink, SpanMetadata, TraceContext, TraceSink};
pub use trajectory::{Trajectory, TrajectoryError, write_trajectory};
