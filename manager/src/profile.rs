//! Equipment profiles
//!
//! A profile names the driver for each equipment role and says where the INDI server
//! lives. Profiles without a host are served by local `indiserver` processes.

use crate::error::{ManagerError, ManagerResult};
use ekos_indi::INDI_DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Equipment role a profile can fill with a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Mount,
    Ccd,
    Guider,
    AdaptiveOptics,
    Filter,
    Focuser,
    Dome,
    Weather,
    Aux1,
    Aux2,
    Aux3,
    Aux4,
}

impl Role {
    pub const ALL: [Role; 12] = [
        Role::Mount,
        Role::Ccd,
        Role::Guider,
        Role::AdaptiveOptics,
        Role::Filter,
        Role::Focuser,
        Role::Dome,
        Role::Weather,
        Role::Aux1,
        Role::Aux2,
        Role::Aux3,
        Role::Aux4,
    ];

    pub const AUX: [Role; 4] = [Role::Aux1, Role::Aux2, Role::Aux3, Role::Aux4];

    /// Key used in the profile's `drivers` map
    pub fn key(&self) -> &'static str {
        match self {
            Role::Mount => "Mount",
            Role::Ccd => "CCD",
            Role::Guider => "Guider",
            Role::AdaptiveOptics => "AO",
            Role::Filter => "Filter",
            Role::Focuser => "Focuser",
            Role::Dome => "Dome",
            Role::Weather => "Weather",
            Role::Aux1 => "Aux1",
            Role::Aux2 => "Aux2",
            Role::Aux3 => "Aux3",
            Role::Aux4 => "Aux4",
        }
    }
}

/// A driver chained from another server, written `device@host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDriver {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl RemoteDriver {
    /// Accepts `device`, `device@host`, `device@host:port`, `@host` and `@host:port`.
    /// Missing parts default to localhost and the standard port.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        let (name, location) = match entry.split_once('@') {
            Some((name, location)) => (name, Some(location)),
            None => (entry, None),
        };

        let mut host = "localhost".to_string();
        let mut port = INDI_DEFAULT_PORT;
        if let Some(location) = location {
            let (h, p) = match location.split_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (location, None),
            };
            if !h.is_empty() {
                host = h.to_string();
            }
            if let Some(p) = p.and_then(|p| p.trim().parse().ok()) {
                port = p;
            }
        }

        Self {
            name: name.to_string(),
            host,
            port,
        }
    }

    /// Label with surrounding quotes stripped
    pub fn label(&self) -> String {
        self.name.replace('"', "")
    }
}

fn default_port() -> u16 {
    INDI_DEFAULT_PORT
}

fn default_auto_connect() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub name: String,
    /// Remote INDI server; `None` means local mode
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect devices as soon as they are announced
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    /// Role key (see [`Role::key`]) to driver label
    #[serde(default)]
    pub drivers: BTreeMap<String, String>,
    /// Comma separated `device@host:port` list chained into the local server
    #[serde(default)]
    pub remote_drivers: String,
}

impl ProfileInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            port: default_port(),
            auto_connect: default_auto_connect(),
            drivers: BTreeMap::new(),
            remote_drivers: String::new(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> ManagerResult<Self> {
        let path = path.as_ref();
        let profile_error = |reason: String| ManagerError::Profile {
            path: path.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| profile_error(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| profile_error(e.to_string()))
    }

    pub fn is_local(&self) -> bool {
        self.host.as_deref().map_or(true, |h| h.trim().is_empty())
    }

    pub fn with_driver(mut self, role: Role, label: &str) -> Self {
        self.drivers.insert(role.key().to_string(), label.to_string());
        self
    }

    /// Driver label for `role`; `--` and blanks mean unset
    pub fn driver(&self, role: Role) -> Option<&str> {
        self.drivers
            .get(role.key())
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty() && *s != "--")
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.driver(role).is_some()
    }

    /// Labels of every assigned role, in role order
    pub fn driver_labels(&self) -> Vec<String> {
        Role::ALL
            .iter()
            .filter_map(|role| self.driver(*role))
            .map(str::to_string)
            .collect()
    }

    /// Parsed remote driver list; empty unless at least one entry names a host
    pub fn remote_driver_list(&self) -> Vec<RemoteDriver> {
        if self.remote_drivers.trim().is_empty() || !self.remote_drivers.contains('@') {
            return Vec::new();
        }
        self.remote_drivers
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(RemoteDriver::parse)
            .collect()
    }
}
