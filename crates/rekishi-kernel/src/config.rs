//! RON-driven configuration.
//!
//! Every field has a default, so an empty file (or `()`) is a valid config:
//!
//! ```ron
//! (
//!     graph: (anchor_window: 200, max_branches: 30),
//!     monitor: (poll_interval_ms: 10000),
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Significant-commit graph settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// How many anchor commits (newest-first) to keep as timeline context.
    pub anchor_window: usize,
    /// Cap on candidate branches resolved from patterns.
    pub max_branches: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            anchor_window: 100,
            max_branches: 20,
        }
    }
}

/// Replay engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Commits per second when a caller does not choose.
    pub default_speed: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { default_speed: 1.0 }
    }
}

/// Change monitor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Cap on the tip-first list compared against a watermark.
    pub max_new_commits: usize,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_new_commits: 500,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RekishiConfig {
    pub graph: GraphConfig,
    pub replay: ReplayConfig,
    pub monitor: MonitorConfig,
    /// Broadcast capacity per flow bus.
    pub flow_capacity: usize,
}

impl Default for RekishiConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            replay: ReplayConfig::default(),
            monitor: MonitorConfig::default(),
            flow_capacity: 1024,
        }
    }
}

impl RekishiConfig {
    /// Parse and validate a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: RekishiConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_ron(&text)?;
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graph.anchor_window == 0 {
            return Err(ConfigError::Invalid("graph.anchor_window must be > 0".into()));
        }
        if self.graph.max_branches == 0 {
            return Err(ConfigError::Invalid("graph.max_branches must be > 0".into()));
        }
        if !(self.replay.default_speed.is_finite() && self.replay.default_speed > 0.0) {
            return Err(ConfigError::Invalid("replay.default_speed must be > 0".into()));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("monitor.poll_interval_ms must be > 0".into()));
        }
        if self.flow_capacity == 0 {
            return Err(ConfigError::Invalid("flow_capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RekishiConfig::default();
        assert_eq!(config.graph.anchor_window, 100);
        assert_eq!(config.graph.max_branches, 20);
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.max_new_commits, 500);
        assert_eq!(config.flow_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(RekishiConfig::from_ron("()").unwrap(), RekishiConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = RekishiConfig::from_ron(
            "(graph: (anchor_window: 250), monitor: (poll_interval_ms: 1000))",
        )
        .unwrap();
        assert_eq!(config.graph.anchor_window, 250);
        assert_eq!(config.graph.max_branches, 20);
        assert_eq!(config.monitor.poll_interval_ms, 1000);
        assert_eq!(config.monitor.max_new_commits, 500);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RekishiConfig::from_ron("(graph: (anchor_window: 0))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = RekishiConfig::from_ron("(replay: (default_speed: -1.0))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = RekishiConfig::from_ron("(graph: ").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RekishiConfig::load(&dir.path().join("missing.ron")).unwrap();
        assert_eq!(config, RekishiConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekishi.ron");
        std::fs::write(&path, "(flow_capacity: 64)").unwrap();
        assert_eq!(RekishiConfig::load(&path).unwrap().flow_capacity, 64);
    }
}
