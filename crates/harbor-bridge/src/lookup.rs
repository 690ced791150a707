//! Instruction → dataset example id table.
//!
//! Built once before any session starts and only read afterwards, so
//! concurrent sessions can share it.

use std::collections::HashMap;
use std::path::Path;

use crate::config::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct ExampleLookup {
    by_instruction: HashMap<String, String>,
}

impl ExampleLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON object mapping instruction text to example id.
    ///
    /// Entries whose value is not a string are skipped.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let map = crate::config::load_trial_config(path)?;
        let lookup: Self = map
            .into_iter()
            .filter_map(|(instruction, id)| match id {
                serde_json::Value::String(id) => Some((instruction, id)),
                other => {
                    tracing::warn!(%instruction, value = %other, "Skipping non-string example id");
                    None
                }
            })
            .collect();
        tracing::debug!(examples = lookup.len(), path = %path.display(), "Loaded example lookup");
        Ok(lookup)
    }

    pub fn get(&self, instruction: &str) -> Option<&str> {
        self.by_instruction.get(instruction).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_instruction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instruction.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExampleLookup {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            by_instruction: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_exact_instruction() {
        let lookup: ExampleLookup = [("Create hello.txt", "ex-1"), ("Fix the tests", "ex-2")]
            .into_iter()
            .collect();
        assert_eq!(lookup.get("Create hello.txt"), Some("ex-1"));
        assert_eq!(lookup.get("create hello.txt"), None);
        assert_eq!(lookup.len(), 2);
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examples.json");
        std::fs::write(&path, r#"{"a": "ex-a", "b": 7}"#).unwrap();

        let lookup = ExampleLookup::from_json_file(&path).unwrap();
        assert_eq!(lookup.get("a"), Some("ex-a"));
        assert_eq!(lookup.get("b"), None);
        assert_eq!(lookup.len(), 1);
    }
}
