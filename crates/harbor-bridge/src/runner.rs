//! Locate the worker runner script and build the command that starts it.

use std::path::{Path, PathBuf};

use crate::config::{BridgeConfig, ENV_RUNNER};
use crate::supervisor::{SpawnError, WorkerCommand};

const BUILT_RUNNER: &str = "dist/runner.js";
const SOURCE_RUNNER: &str = "src/runner.ts";

/// Find the runner script.
///
/// Search order: explicit override, `<root>/dist/runner.js`, `<root>/src/runner.ts`.
/// An override that is not a file falls through to the defaults.
pub fn find_runner(override_path: Option<&Path>, root: &Path) -> Result<PathBuf, SpawnError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "Runner override is not a file, searching defaults");
    }

    let candidates = [root.join(BUILT_RUNNER), root.join(SOURCE_RUNNER)];
    if let Some(found) = candidates.iter().find(|c| c.is_file()) {
        return Ok(found.clone());
    }

    let override_label =
        override_path.map_or_else(|| "(not set)".to_string(), |p| p.display().to_string());
    let mut searched = vec![format!("{ENV_RUNNER}: {override_label}")];
    searched.extend(candidates.iter().map(|c| c.display().to_string()));
    Err(SpawnError::RunnerNotFound {
        searched: searched.join("\n  "),
    })
}

/// `tsx` for TypeScript sources, `node` for everything else.
pub fn runner_command(runner: &Path) -> WorkerCommand {
    let interpreter = match runner.extension().and_then(|e| e.to_str()) {
        Some("ts") => "tsx",
        _ => "node",
    };
    WorkerCommand::new(interpreter).arg(runner.display().to_string())
}

/// Resolve the worker command for `config`.
pub fn worker_command(config: &BridgeConfig) -> Result<WorkerCommand, SpawnError> {
    let runner = find_runner(config.runner.as_deref(), &config.runner_root)?;
    Ok(runner_command(&runner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn built_runner_wins_over_source() {
        let dir = tempfile::tempdir().unwrap();
        let built = touch(dir.path(), BUILT_RUNNER);
        touch(dir.path(), SOURCE_RUNNER);

        assert_eq!(find_runner(None, dir.path()).unwrap(), built);
    }

    #[test]
    fn source_runner_uses_tsx() {
        let dir = tempfile::tempdir().unwrap();
        let source = touch(dir.path(), SOURCE_RUNNER);

        let config = BridgeConfig::new().with_runner_root(dir.path());
        let cmd = worker_command(&config).unwrap();
        assert_eq!(cmd.program, "tsx");
        assert_eq!(cmd.args, vec![source.display().to_string()]);
    }

    #[test]
    fn override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), BUILT_RUNNER);
        let custom = touch(dir.path(), "custom/agent.mjs");

        let config = BridgeConfig::new()
            .with_runner_root(dir.path())
            .with_runner(custom.clone());
        let cmd = worker_command(&config).unwrap();
        assert_eq!(cmd.program, "node");
        assert_eq!(cmd.args, vec![custom.display().to_string()]);
    }

    #[test]
    fn missing_override_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let built = touch(dir.path(), BUILT_RUNNER);
        let found = find_runner(Some(&dir.path().join("nope.js")), dir.path()).unwrap();
        assert_eq!(found, built);
    }

    #[test]
    fn not_found_lists_every_searched_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_runner(None, dir.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("HARBOR_WORKER_RUNNER: (not set)"));
        assert!(message.contains(BUILT_RUNNER));
        assert!(message.contains(SOURCE_RUNNER));
    }
}
