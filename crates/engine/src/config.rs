use std::path::Path;

use serde::{Deserialize, Serialize};

use bibedit_core::validation::ProtectedFields;

use crate::error::EngineError;

/// Editor settings. Every key is optional in the TOML form.
///
/// ```toml
/// auto_flush_interval_ms = 5000
/// undo_depth = 100
/// protected_fields = ["001", "005", "8564_u"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Pending requests are flushed automatically only once more than this
    /// much time has passed since the previous flush completed.
    pub auto_flush_interval_ms: u64,
    pub undo_depth: usize,
    /// Report fields and subfields missing from a holding-pen revision as
    /// removals.
    pub report_removed: bool,
    pub protected_fields: ProtectedFields,
    pub cache_timeout_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub poll_factor: u32,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            auto_flush_interval_ms: 5_000,
            undo_depth: 100,
            report_removed: true,
            protected_fields: ProtectedFields::new(["001", "002", "003", "005"]),
            cache_timeout_secs: 3_600,
            poll_initial_ms: 1_000,
            poll_max_ms: 60_000,
            poll_factor: 2,
        }
    }
}

impl EditorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.undo_depth == 0 {
            return Err(EngineError::Config("undo_depth must be at least 1".into()));
        }
        if self.poll_factor < 1 {
            return Err(EngineError::Config("poll_factor must be at least 1".into()));
        }
        if self.poll_initial_ms > self.poll_max_ms {
            return Err(EngineError::Config(
                "poll_initial_ms must not exceed poll_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_timeout_ms(&self) -> u64 {
        self.cache_timeout_secs * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = EditorConfig::from_toml_str("").unwrap();
        assert_eq!(config, EditorConfig::default());
        assert_eq!(config.auto_flush_interval_ms, 5_000);
        assert!(config.protected_fields.is_protected("001"));
    }

    #[test]
    fn partial_override() {
        let config = EditorConfig::from_toml_str(
            r#"
            undo_depth = 10
            report_removed = false
            protected_fields = ["8564_u"]
            "#,
        )
        .unwrap();
        assert_eq!(config.undo_depth, 10);
        assert!(!config.report_removed);
        assert!(config.protected_fields.is_protected("8564_u"));
        assert!(!config.protected_fields.is_protected("001"));
        assert_eq!(config.poll_factor, 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EditorConfig::from_toml_str("undo_depth = 0"),
            Err(EngineError::Config(_))
        ));
        assert!(EditorConfig::from_toml_str("undo_depth = \"many\"").is_err());
    }
}
