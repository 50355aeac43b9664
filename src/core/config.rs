use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::events::DEFAULT_CARD_LABEL;
use crate::core::poller::PollerConfig;
use crate::core::reader::ContextScope;

fn default_rescan_interval_ms() -> u64 {
    2000
}

fn default_card_label() -> String {
    DEFAULT_CARD_LABEL.to_string()
}

/// Monitor settings, loaded from a JSON file and overridden from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub scope: ContextScope,
    /// Status wait timeout; absent waits forever
    pub poll_timeout_ms: Option<u64>,
    /// Delay before enumerating again when no reader is connected
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    #[serde(default = "default_card_label")]
    pub card_label: String,
    /// Command run against every inserted card; empty disables it
    pub tool: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scope: ContextScope::User,
            poll_timeout_ms: None,
            rescan_interval_ms: default_rescan_interval_ms(),
            card_label: default_card_label(),
            tool: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: MonitorConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::debug!("Loaded config from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_ms.map(Duration::from_millis)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            scope: self.scope,
            timeout: self.poll_timeout(),
            card_label: self.card_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_timeout(), None);
        assert_eq!(config.rescan_interval(), Duration::from_secs(2));
        assert_eq!(config.card_label, "Card Found");
        assert!(config.tool.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: MonitorConfig = serde_json::from_str(r#"{"poll_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.poll_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.rescan_interval_ms, 2000);
        assert_eq!(config.scope, ContextScope::User);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "scope": "system",
                "card_label": "Badge",
                "tool": ["pkcs15-tool", "--list-data-objects", "--short"]
            }}"#
        )
        .unwrap();

        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.scope, ContextScope::System);
        assert_eq!(config.tool.len(), 3);

        let poller = config.poller_config();
        assert_eq!(poller.scope, ContextScope::System);
        assert_eq!(poller.card_label, "Badge");
        assert_eq!(poller.timeout, None);
    }

    #[test]
    fn test_load_rejects_bad_files() {
        assert!(MonitorConfig::load("/nonexistent/monitor.json").is_err());

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_timeout": 5}}"#).unwrap();
        let err = MonitorConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
