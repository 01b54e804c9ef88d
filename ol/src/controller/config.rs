//! Controller configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory
const LOCAL_CONFIG: &str = ".offloop.yml";

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name given to the worker thread
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,

    /// How long the default host loop sleeps when the command queue is
    /// empty, in milliseconds
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// Start the worker on first submission instead of requiring an
    /// explicit `start()`
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_worker_thread_name() -> String {
    "offloop-worker".to_string()
}

fn default_idle_wait_ms() -> u64 {
    1
}

fn default_auto_start() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: default_worker_thread_name(),
            idle_wait_ms: default_idle_wait_ms(),
            auto_start: default_auto_start(),
        }
    }
}

impl ControllerConfig {
    /// Get the idle wait as a Duration
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Load configuration with fallback chain: explicit path, then
    /// `.offloop.yml` in the working directory, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a YAML file
    fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.worker_thread_name, "offloop-worker");
        assert_eq!(config.idle_wait_ms, 1);
        assert!(config.auto_start);
    }

    #[test]
    fn test_idle_wait_duration() {
        let config = ControllerConfig {
            idle_wait_ms: 25,
            ..Default::default()
        };
        assert_eq!(config.idle_wait(), Duration::from_millis(25));
    }

    #[test]
    fn test_load_from_yaml_with_partial_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "worker_thread_name: widget-host").unwrap();
        writeln!(file, "auto_start: false").unwrap();

        let path = file.path().to_path_buf();
        let config = ControllerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker_thread_name, "widget-host");
        assert!(!config.auto_start);
        // Unspecified fields fall back to defaults
        assert_eq!(config.idle_wait_ms, 1);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/offloop.yml");
        assert!(ControllerConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = ControllerConfig {
            worker_thread_name: "w".to_string(),
            idle_wait_ms: 10,
            auto_start: false,
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ControllerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.worker_thread_name, "w");
        assert_eq!(parsed.idle_wait_ms, 10);
        assert!(!parsed.auto_start);
    }
}
