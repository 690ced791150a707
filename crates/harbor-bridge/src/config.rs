//! Bridge configuration.
//!
//! Built in code with the `with_*` methods or read from `HARBOR_*`
//! environment variables. Session-specific values (instruction, session id)
//! are never part of this; they travel in the `init` frame.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::supervisor::{DEFAULT_SHUTDOWN_GRACE, SupervisorConfig};

pub const DEFAULT_MODEL: &str = "anthropic:claude-sonnet-4-5-20250929";

pub const ENV_MODEL: &str = "HARBOR_MODEL";
pub const ENV_RUNNER: &str = "HARBOR_WORKER_RUNNER";
pub const ENV_EXPERIMENT: &str = "HARBOR_EXPERIMENT";
pub const ENV_SHUTDOWN_GRACE: &str = "HARBOR_SHUTDOWN_GRACE_SECS";
pub const ENV_MAX_FRAME_BYTES: &str = "HARBOR_MAX_FRAME_BYTES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read trial config {}: {source}", path.display())]
    TrialConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse trial config {}: {source}", path.display())]
    TrialConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("trial config {} must be a JSON object, got {found}", path.display())]
    TrialConfigNotObject { path: PathBuf, found: &'static str },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Model identifier handed to the worker in `init`.
    pub model: String,
    /// Directory receiving `trajectory.json`.
    pub logs_dir: PathBuf,
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
    /// Explicit runner script; skips discovery when set.
    pub runner: Option<PathBuf>,
    /// Directory searched for `dist/runner.js` and `src/runner.ts`.
    pub runner_root: PathBuf,
    /// Tracing is enabled only when an experiment is named.
    pub experiment: Option<String>,
    /// Trial configuration, merged into trace metadata.
    pub trial_config: Map<String, Value>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            logs_dir: PathBuf::from("logs"),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            runner: None,
            runner_root: PathBuf::from("."),
            experiment: None,
            trial_config: Map::new(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `HARBOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(model) = get(ENV_MODEL) {
            config.model = model;
        }
        if let Some(runner) = get(ENV_RUNNER) {
            config.runner = Some(PathBuf::from(runner));
        }
        config.experiment = get(ENV_EXPERIMENT);

        if let Some(raw) = get(ENV_SHUTDOWN_GRACE) {
            let secs = raw
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite() && *s >= 0.0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: ENV_SHUTDOWN_GRACE,
                    value: raw.clone(),
                    reason: "expected a non-negative number of seconds".to_string(),
                })?;
            config.shutdown_grace = Duration::from_secs_f64(secs);
        }

        if let Some(raw) = get(ENV_MAX_FRAME_BYTES) {
            let bytes = raw
                .parse::<usize>()
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: ENV_MAX_FRAME_BYTES,
                    value: raw.clone(),
                    reason: "expected a positive byte count".to_string(),
                })?;
            config.max_frame_bytes = bytes;
        }

        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = dir.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_runner(mut self, runner: impl Into<PathBuf>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    pub fn with_runner_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.runner_root = root.into();
        self
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }

    pub fn with_trial_config(mut self, trial_config: Map<String, Value>) -> Self {
        self.trial_config = trial_config;
        self
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Read a trial configuration file. It must hold a single JSON object.
pub fn load_trial_config(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::TrialConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value =
        serde_json::from_str(&text).map_err(|source| ConfigError::TrialConfigParse {
            path: path.to_path_buf(),
            source,
        })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::TrialConfigNotObject {
            path: path.to_path_buf(),
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, 100 * 1024 * 1024);
        assert!(config.experiment.is_none());
        assert!(config.runner.is_none());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (ENV_MODEL, "openai:gpt-4o"),
            (ENV_RUNNER, "/opt/runner.js"),
            (ENV_EXPERIMENT, " terminal-bench-v2 "),
            (ENV_SHUTDOWN_GRACE, "0.5"),
            (ENV_MAX_FRAME_BYTES, "1048576"),
        ]))
        .unwrap();
        assert_eq!(config.model, "openai:gpt-4o");
        assert_eq!(config.runner, Some(PathBuf::from("/opt/runner.js")));
        assert_eq!(config.experiment.as_deref(), Some("terminal-bench-v2"));
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
        assert_eq!(config.supervisor().max_frame_bytes, 1_048_576);
    }

    #[test]
    fn blank_experiment_disables_tracing() {
        let config = BridgeConfig::from_lookup(lookup(&[(ENV_EXPERIMENT, "   ")])).unwrap();
        assert!(config.experiment.is_none());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[(ENV_SHUTDOWN_GRACE, "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: ENV_SHUTDOWN_GRACE,
                ..
            }
        ));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_MAX_FRAME_BYTES, "0")])).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_FRAME_BYTES));
    }

    #[test]
    fn builder_methods_set_fields() {
        let config = BridgeConfig::new()
            .with_model("m")
            .with_logs_dir("/tmp/logs")
            .with_runner_root("/srv/harbor")
            .with_experiment("exp")
            .with_shutdown_grace(Duration::from_secs(1));
        assert_eq!(config.model, "m");
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.runner_root, PathBuf::from("/srv/harbor"));
        assert_eq!(config.experiment.as_deref(), Some("exp"));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn trial_config_must_be_object() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("config.json");
        std::fs::write(&good, r#"{"agent": {"name": "js"}, "attempt": 2}"#).unwrap();
        let map = load_trial_config(&good).unwrap();
        assert_eq!(map["attempt"], 2);

        let list = dir.path().join("list.json");
        std::fs::write(&list, "[1, 2]").unwrap();
        let err = load_trial_config(&list).unwrap_err();
        assert!(matches!(err, ConfigError::TrialConfigNotObject { found: "an array", .. }));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        assert!(matches!(
            load_trial_config(&broken).unwrap_err(),
            ConfigError::TrialConfigParse { .. }
        ));

        assert!(matches!(
            load_trial_config(&dir.path().join("missing.json")).unwrap_err(),
            ConfigError::TrialConfigRead { .. }
        ));
    }
}
