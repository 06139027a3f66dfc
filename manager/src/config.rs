//! Manager configuration

use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// `MAX_LOCAL_INDI_TIMEOUT`
fn default_local_timeout_ms() -> u64 {
    5000
}

/// `MAX_REMOTE_INDI_TIMEOUT`
fn default_remote_timeout_ms() -> u64 {
    15000
}

/// What to do with a driver's saved configuration once the device connects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOnConnect {
    /// Load the last saved configuration
    #[default]
    LoadLast,
    /// Load the driver defaults
    LoadDefault,
    Never,
}

impl ConfigOnConnect {
    /// `CONFIG_PROCESS` element to switch on, if any
    pub fn element(&self) -> Option<&'static str> {
        match self {
            ConfigOnConnect::LoadLast => Some("CONFIG_LOAD"),
            ConfigOnConnect::LoadDefault => Some("CONFIG_DEFAULT"),
            ConfigOnConnect::Never => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long local drivers get to announce their devices
    #[serde(default = "default_local_timeout_ms")]
    pub local_timeout_ms: u64,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default)]
    pub config_on_connect: ConfigOnConnect,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_timeout_ms: default_local_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            config_on_connect: ConfigOnConnect::default(),
        }
    }
}

impl ManagerConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> ManagerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManagerError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ManagerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn device_timeout(&self, local: bool) -> Duration {
        if local {
            Duration::from_millis(self.local_timeout_ms)
        } else {
            Duration::from_millis(self.remote_timeout_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.device_timeout(true), Duration::from_secs(5));
        assert_eq!(config.device_timeout(false), Duration::from_secs(15));
        assert_eq!(config.config_on_connect.element(), Some("CONFIG_LOAD"));

        let config: ManagerConfig =
            serde_json::from_str(r#"{"config_on_connect": "never"}"#).unwrap();
        assert_eq!(config.config_on_connect.element(), None);
    }
}
