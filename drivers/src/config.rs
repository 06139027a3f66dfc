//! Driver manager configuration

use crate::error::{DriverError, DriverResult};
use ekos_indi::BlobMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_indi_server() -> PathBuf {
    PathBuf::from("/usr/bin/indiserver")
}

fn default_drivers_dir() -> PathBuf {
    PathBuf::from("/usr/share/indi")
}

fn default_fifo_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_port_start() -> u16 {
    7624
}

fn default_port_end() -> u16 {
    9000
}

fn default_buffer_size() -> u32 {
    100
}

fn default_max_connect_tries() -> u32 {
    2
}

fn default_connect_retry_delay_ms() -> u64 {
    100
}

fn default_startup_grace_ms() -> u64 {
    250
}

fn default_restart_delay_ms() -> u64 {
    1000
}

/// Options consumed by [`crate::DriverManager`] and the server/client managers it creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverManagerConfig {
    /// Path of the `indiserver` executable
    #[serde(default = "default_indi_server")]
    pub indi_server: PathBuf,
    /// Directory holding driver catalogs and skeleton files
    #[serde(default = "default_drivers_dir")]
    pub drivers_dir: PathBuf,
    /// Where control FIFOs are created
    #[serde(default = "default_fifo_dir")]
    pub fifo_dir: PathBuf,
    #[serde(default = "default_port_start")]
    pub server_port_start: u16,
    #[serde(default = "default_port_end")]
    pub server_port_end: u16,
    /// Passed to the server as `-m`, in megabytes
    #[serde(default = "default_buffer_size")]
    pub server_transfer_buffer_size: u32,
    #[serde(default = "default_max_connect_tries")]
    pub max_connect_tries: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// How long a freshly spawned server must survive before it counts as started
    #[serde(default = "default_startup_grace_ms")]
    pub server_startup_grace_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub driver_restart_delay_ms: u64,
    #[serde(default)]
    pub restart_crashed_drivers: bool,
    /// Start servers without opening client sessions
    #[serde(default)]
    pub server_only: bool,
    #[serde(default)]
    pub blob_mode: BlobMode,
}

impl Default for DriverManagerConfig {
    fn default() -> Self {
        Self {
            indi_server: default_indi_server(),
            drivers_dir: default_drivers_dir(),
            fifo_dir: default_fifo_dir(),
            server_port_start: default_port_start(),
            server_port_end: default_port_end(),
            server_transfer_buffer_size: default_buffer_size(),
            max_connect_tries: default_max_connect_tries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            server_startup_grace_ms: default_startup_grace_ms(),
            driver_restart_delay_ms: default_restart_delay_ms(),
            restart_crashed_drivers: false,
            server_only: false,
            blob_mode: BlobMode::Also,
        }
    }
}

impl DriverManagerConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.server_port_start == 0 || self.server_port_start > self.server_port_end {
            return Err(DriverError::Config(format!(
                "invalid server port range {}-{}",
                self.server_port_start, self.server_port_end
            )));
        }
        if self.max_connect_tries == 0 {
            return Err(DriverError::Config(
                "max_connect_tries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory containing the server executable
    pub fn server_dir(&self) -> PathBuf {
        self.indi_server
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/usr/bin"))
    }

    /// `PATH` handed to the server so it can find drivers
    pub fn server_path_env(&self) -> String {
        format!(
            "{}:{}:/usr/local/bin:/usr/bin:/bin",
            self.drivers_dir.display(),
            self.server_dir().display()
        )
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn server_startup_grace(&self) -> Duration {
        Duration::from_millis(self.server_startup_grace_ms)
    }

    pub fn driver_restart_delay(&self) -> Duration {
        Duration::from_millis(self.driver_restart_delay_ms)
    }
}
