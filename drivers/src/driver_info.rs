//! Driver descriptors
//!
//! A [`DriverInfo`] describes one drivable executable: where it comes from (catalog,
//! host list, custom entry), where it runs, and which live devices it produced.
//! Managers share descriptors through [`DriverHandle`] so state flips made by a
//! ServerManager are visible to the ClientManager and the DriverManager roster.

use crate::device_info::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared, mutable driver descriptor
pub type DriverHandle = Arc<RwLock<DriverInfo>>;

/// Aux key flagging a driver that exposes several devices from one process
pub const AUX_MDPD: &str = "mdpd";
/// Aux key recording whether the executable exists next to the server binary
pub const AUX_LOCALLY_AVAILABLE: &str = "LOCALLY_AVAILABLE";

/// Where a driver descriptor was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DriverSource {
    /// `drivers.xml`
    Primary,
    /// `indi_*.xml` shipped by third-party driver packages
    ThirdParty,
    /// Remote host entry; no local server
    Host,
    /// User-defined driver
    Custom,
    /// Synthesized at runtime (e.g. remote profile catch-all)
    Generated,
}

/// Device family, from the catalog group or from runtime property classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceFamily {
    Telescope,
    Ccd,
    Filter,
    Focuser,
    Dome,
    Weather,
    #[default]
    Auxiliary,
    AdaptiveOptics,
    Rotator,
    Detector,
    Spectrograph,
    Agent,
    DustCap,
    LightBox,
    St4,
}

impl DeviceFamily {
    /// Family from a catalog `devGroup` label
    pub fn from_group(group: &str) -> Self {
        match group {
            "Telescopes" => DeviceFamily::Telescope,
            "CCDs" | "Cameras" => DeviceFamily::Ccd,
            "Filter Wheels" => DeviceFamily::Filter,
            "Focusers" => DeviceFamily::Focuser,
            "Domes" => DeviceFamily::Dome,
            "Weather" => DeviceFamily::Weather,
            "Adaptive Optics" => DeviceFamily::AdaptiveOptics,
            "Rotators" => DeviceFamily::Rotator,
            "Detectors" => DeviceFamily::Detector,
            "Spectrographs" => DeviceFamily::Spectrograph,
            "Agent" => DeviceFamily::Agent,
            _ => DeviceFamily::Auxiliary,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceFamily::Telescope => "Telescopes",
            DeviceFamily::Ccd => "CCDs",
            DeviceFamily::Filter => "Filter Wheels",
            DeviceFamily::Focuser => "Focusers",
            DeviceFamily::Dome => "Domes",
            DeviceFamily::Weather => "Weather",
            DeviceFamily::Auxiliary => "Auxiliary",
            DeviceFamily::AdaptiveOptics => "Adaptive Optics",
            DeviceFamily::Rotator => "Rotators",
            DeviceFamily::Detector => "Detectors",
            DeviceFamily::Spectrograph => "Spectrographs",
            DeviceFamily::Agent => "Agent",
            DeviceFamily::DustCap => "Dust Caps",
            DeviceFamily::LightBox => "Light Boxes",
            DeviceFamily::St4 => "ST4",
        }
    }
}

/// Serializable summary used for driver listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub name: String,
    pub label: String,
    pub binary: String,
    pub version: String,
    pub manufacturer: String,
    pub skeleton: String,
    pub family: String,
    pub source: DriverSource,
}

#[derive(Debug, Clone)]
pub struct DriverInfo {
    id: Uuid,
    /// Logical driver name, as published in `DRIVER_INFO.DRIVER_NAME`
    pub name: String,
    /// Catalog label
    pub label: String,
    unique_label: String,
    pub exec: String,
    pub version: String,
    /// Skeleton file, relative to the drivers directory
    pub skeleton: String,
    pub manufacturer: String,
    pub host: String,
    /// Port the driver is currently served on
    pub port: Option<u16>,
    /// Port requested by catalog or user; restored when the driver stops
    pub user_port: Option<u16>,
    /// Chained remote driver (`name@host:port`)
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub family: DeviceFamily,
    pub source: DriverSource,
    server_state: bool,
    client_state: bool,
    pub aux: BTreeMap<String, serde_json::Value>,
    devices: Vec<DeviceInfo>,
    server_manager: Option<Uuid>,
    client_manager: Option<Uuid>,
}

impl DriverInfo {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: String::new(),
            unique_label: String::new(),
            exec: String::new(),
            version: "1.0".to_string(),
            skeleton: String::new(),
            manufacturer: "Others".to_string(),
            host: "localhost".to_string(),
            port: None,
            user_port: None,
            remote_host: None,
            remote_port: None,
            family: DeviceFamily::default(),
            source: DriverSource::Primary,
            server_state: false,
            client_state: false,
            aux: BTreeMap::new(),
            devices: Vec::new(),
            server_manager: None,
            client_manager: None,
        }
    }

    /// Wrap into a shared handle
    pub fn into_handle(self) -> DriverHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Copy of the descriptive fields with fresh identity and no runtime state
    pub fn clone_fresh(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_state: false,
            client_state: false,
            devices: Vec::new(),
            server_manager: None,
            client_manager: None,
            port: self.user_port,
            ..self.clone()
        }
    }

    pub fn unique_label(&self) -> &str {
        &self.unique_label
    }

    /// Returns false, leaving the label untouched, for multi-device drivers and for
    /// host, custom or generated descriptors whose label identifies the wire device.
    pub fn set_unique_label(&mut self, label: &str) -> bool {
        if self.is_mdpd() || self.source >= DriverSource::Host {
            return false;
        }
        self.unique_label = label.to_string();
        true
    }

    /// Unique label if assigned, else the catalog label
    pub fn display_label(&self) -> &str {
        if self.unique_label.is_empty() {
            &self.label
        } else {
            &self.unique_label
        }
    }

    /// Multiple devices per driver
    pub fn is_mdpd(&self) -> bool {
        self.aux
            .get(AUX_MDPD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_user_port(&mut self, port: Option<u16>) {
        self.user_port = port;
        self.port = port;
    }

    pub fn set_host_parameters(&mut self, host: &str, port: Option<u16>) {
        self.host = host.to_string();
        self.port = port;
    }

    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }

    pub fn server_state(&self) -> bool {
        self.server_state
    }

    pub fn set_server_state(&mut self, state: bool) {
        self.server_state = state;
    }

    pub fn client_state(&self) -> bool {
        self.client_state
    }

    pub fn set_client_state(&mut self, state: bool) {
        self.client_state = state;
    }

    /// Running on either side
    pub fn is_active(&self) -> bool {
        self.server_state || self.client_state
    }

    pub fn server_manager(&self) -> Option<Uuid> {
        self.server_manager
    }

    pub fn set_server_manager(&mut self, id: Option<Uuid>) {
        self.server_manager = id;
    }

    pub fn client_manager(&self) -> Option<Uuid> {
        self.client_manager
    }

    pub fn set_client_manager(&mut self, id: Option<Uuid>) {
        self.client_manager = id;
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn add_device(&mut self, device: DeviceInfo) {
        if !self.devices.iter().any(|d| d.name() == device.name()) {
            self.devices.push(device);
        }
    }

    pub fn remove_device(&mut self, name: &str) -> Option<DeviceInfo> {
        let idx = self.devices.iter().position(|d| d.name() == name)?;
        Some(self.devices.remove(idx))
    }

    pub fn clear_devices(&mut self) {
        self.devices.clear();
    }

    /// Drop all runtime state
    pub fn reset(&mut self) {
        self.server_state = false;
        self.client_state = false;
        self.server_manager = None;
        self.client_manager = None;
        self.devices.clear();
    }

    pub fn to_summary(&self) -> DriverSummary {
        DriverSummary {
            name: self.name.clone(),
            label: self.label.clone(),
            binary: self.exec.clone(),
            version: self.version.clone(),
            manufacturer: self.manufacturer.clone(),
            skeleton: self.skeleton.clone(),
            family: self.family.label().to_string(),
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ccd_simulator() -> DriverInfo {
        let mut dv = DriverInfo::new("CCD Simulator");
        dv.label = "CCD Simulator".to_string();
        dv.exec = "indi_simulator_ccd".to_string();
        dv.family = DeviceFamily::Ccd;
        dv.set_user_port(Some(7624));
        dv
    }

    #[test]
    fn test_clone_fresh_drops_runtime_state() {
        let mut dv = ccd_simulator();
        dv.set_server_state(true);
        dv.set_client_state(true);
        dv.set_server_manager(Some(Uuid::new_v4()));
        dv.port = Some(7700);

        let fresh = dv.clone_fresh();
        assert_ne!(fresh.id(), dv.id());
        assert!(!fresh.server_state());
        assert!(!fresh.client_state());
        assert!(fresh.server_manager().is_none());
        assert_eq!(fresh.port, Some(7624));
        assert_eq!(fresh.exec, "indi_simulator_ccd");
        assert_eq!(fresh.family, DeviceFamily::Ccd);
    }

    #[test]
    fn test_unique_label_refused_for_mdpd_and_host() {
        let mut dv = ccd_simulator();
        assert!(dv.set_unique_label("CCD Simulator 2"));
        assert_eq!(dv.unique_label(), "CCD Simulator 2");

        dv.aux.insert(AUX_MDPD.to_string(), serde_json::Value::Bool(true));
        assert!(!dv.set_unique_label("Other"));
        assert_eq!(dv.unique_label(), "CCD Simulator 2");

        let mut host = DriverInfo::new("Observatory");
        host.source = DriverSource::Host;
        assert!(!host.set_unique_label("Observatory 2"));
        assert_eq!(host.display_label(), "");
    }

    #[test]
    fn test_summary_uses_family_label() {
        let summary = ccd_simulator().to_summary();
        assert_eq!(summary.binary, "indi_simulator_ccd");
        assert_eq!(summary.family, "CCDs");
        assert_eq!(summary.manufacturer, "Others");
    }

    #[test]
    fn test_family_from_group() {
        assert_eq!(DeviceFamily::from_group("Telescopes"), DeviceFamily::Telescope);
        assert_eq!(DeviceFamily::from_group("Filter Wheels"), DeviceFamily::Filter);
        assert_eq!(DeviceFamily::from_group("Something New"), DeviceFamily::Auxiliary);
    }
}
