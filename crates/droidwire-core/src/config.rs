//! Persistent configuration for droidwire.
//!
//! Stores user settings in `~/.droidwire/config.json`. The settings control
//! default timeouts for element waits and JSON-RPC calls, the retry policy of
//! click-until-gone, and the default polling interval of watch loops.
//!
//! # Example
//!
//! ```no_run
//! use droidwire_core::config::DeviceConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = DeviceConfig::load();
//! println!("waits default to {}s", config.wait_timeout_secs);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Returns the droidwire state directory (`~/.droidwire/`).
pub fn droidwire_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".droidwire")
}

/// Client-side tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Default timeout for element existence waits, in seconds.
    pub wait_timeout_secs: f64,
    /// Default HTTP timeout for a JSON-RPC call, in seconds.
    pub rpc_timeout_secs: f64,
    /// Extra transport time granted on top of a wait's own timeout.
    pub wait_slack_secs: f64,
    /// Maximum number of re-clicks performed by `click_gone`.
    pub click_gone_retries: u32,
    /// Sleep between `click_gone` attempts, in milliseconds.
    pub click_gone_interval_ms: u64,
    /// Default polling interval for watch contexts, in milliseconds.
    pub watch_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 20.0,
            rpc_timeout_secs: 60.0,
            wait_slack_secs: 10.0,
            click_gone_retries: 10,
            click_gone_interval_ms: 1000,
            watch_interval_ms: 2000,
        }
    }
}

impl DeviceConfig {
    /// Load config from `~/.droidwire/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = droidwire_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.droidwire/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = droidwire_dir();
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(dir.join(CONFIG_FILENAME), json)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.wait_timeout_secs.max(0.0))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rpc_timeout_secs.max(0.0))
    }

    pub fn wait_slack(&self) -> Duration {
        Duration::from_secs_f64(self.wait_slack_secs.max(0.0))
    }

    pub fn click_gone_interval(&self) -> Duration {
        Duration::from_millis(self.click_gone_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = DeviceConfig::default();
        assert_eq!(config.wait_timeout(), Duration::from_secs(20));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(60));
        assert_eq!(config.click_gone_retries, 10);
        assert_eq!(config.watch_interval(), Duration::from_secs(2));
    }

    #[test]
    fn roundtrip_serialization() {
        let config = DeviceConfig {
            wait_timeout_secs: 5.5,
            ..DeviceConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let loaded: DeviceConfig = serde_json::from_str(r#"{"click_gone_retries": 3}"#).unwrap();
        assert_eq!(loaded.click_gone_retries, 3);
        assert_eq!(loaded.wait_timeout_secs, 20.0);
    }

    #[test]
    fn negative_timeouts_clamp_to_zero() {
        let config = DeviceConfig {
            wait_timeout_secs: -1.0,
            ..DeviceConfig::default()
        };
        assert_eq!(config.wait_timeout(), Duration::ZERO);
    }

    #[test]
    fn load_returns_default_for_missing_file() {
        // Should not panic even if the file doesn't exist.
        let _ = DeviceConfig::load();
    }
}
