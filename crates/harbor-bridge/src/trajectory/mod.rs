//! Trajectory reconstruction and persistence.

pub mod reconstruct;
pub mod types;

use std::path::{Path, PathBuf};

pub use reconstruct::{
    AGENT_NAME, AGENT_VERSION, SessionMeta, reconstruct, reconstruct_with_clock,
};
pub use types::{
    Agent, FinalMetrics, Observation, ObservationResult, SCHEMA_VERSION, Step, StepSource,
    ToolCall, Trajectory,
};

/// File name of the persisted trajectory inside the logs directory.
pub const TRAJECTORY_FILE: &str = "trajectory.json";

#[derive(Debug, thiserror::Error)]
pub enum TrajectoryError {
    #[error("failed to serialize trajectory: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write trajectory to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write `dir/trajectory.json`, creating `dir` if needed.
pub async fn write_trajectory(
    trajectory: &Trajectory,
    dir: &Path,
) -> Result<PathBuf, TrajectoryError> {
    let path = dir.join(TRAJECTORY_FILE);
    let json = serde_json::to_string_pretty(trajectory)?;

    let io_err = |source: std::io::Error| TrajectoryError::Write {
        path: path.clone(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    tokio::fs::write(&path, json).await.map_err(io_err)?;

    tracing::info!(
        path = %path.display(),
        steps = trajectory.steps.len(),
        "Trajectory written"
    );
    Ok(path)
}
