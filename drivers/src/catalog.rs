//! Driver catalog and host list files
//!
//! Catalogs are the `drivers.xml` / `indi_*.xml` files shipped with INDI:
//!
//! ```xml
//! <driversList>
//!   <devGroup group="Telescopes">
//!     <device label="Telescope Simulator" manufacturer="Simulators">
//!       <driver name="Telescope Simulator">indi_simulator_telescope</driver>
//!       <version>1.0</version>
//!     </device>
//!   </devGroup>
//! </driversList>
//! ```
//!
//! The host list is a flat sequence of `<INDIHost name=".." hostname=".." port=".."/>`.

use crate::driver_info::{
    DeviceFamily, DriverInfo, DriverSource, AUX_LOCALLY_AVAILABLE, AUX_MDPD,
};
use crate::error::{DriverError, DriverResult};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const PRIMARY_CATALOG: &str = "drivers.xml";
const SKELETON_SUFFIX: &str = "_sk.xml";

fn attributes(e: &BytesStart) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
            let value = a
                .unescape_value()
                .map(|v| v.to_string())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).to_string());
            (key, value)
        })
        .collect()
}

/// Source implied by a catalog file name
pub fn catalog_source(file_name: &str) -> DriverSource {
    if file_name.ends_with(PRIMARY_CATALOG) {
        DriverSource::Primary
    } else {
        DriverSource::ThirdParty
    }
}

#[derive(Default)]
struct PendingDevice {
    label: String,
    attrs: HashMap<String, String>,
    name: Option<String>,
    exec: String,
    version: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum TextTarget {
    None,
    Exec,
    Version,
}

/// Parse one catalog document. Devices missing a label, driver name or version are
/// skipped with a warning.
pub fn parse_catalog(xml: &str, source: DriverSource) -> DriverResult<Vec<DriverInfo>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut drivers = Vec::new();
    let mut family = DeviceFamily::default();
    let mut device: Option<PendingDevice> = None;
    let mut target = TextTarget::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let attrs = attributes(&e);
                match e.name().as_ref() {
                    b"devGroup" => {
                        family = attrs
                            .get("group")
                            .map(|g| DeviceFamily::from_group(g))
                            .unwrap_or_default();
                    }
                    b"device" => match attrs.get("label") {
                        Some(label) => {
                            device = Some(PendingDevice {
                                label: label.clone(),
                                attrs,
                                ..Default::default()
                            });
                        }
                        None => {
                            tracing::warn!("Catalog device without label attribute skipped");
                            device = None;
                        }
                    },
                    b"driver" => {
                        if let Some(dev) = device.as_mut() {
                            dev.name = attrs.get("name").cloned();
                            target = TextTarget::Exec;
                        }
                    }
                    b"version" => {
                        if let Some(dev) = device.as_mut() {
                            dev.version.get_or_insert_with(String::new);
                            target = TextTarget::Version;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(dev) = device.as_mut() {
                    let text = e
                        .unescape()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&e).to_string());
                    match target {
                        TextTarget::Exec => dev.exec = text,
                        TextTarget::Version => dev.version = Some(text),
                        TextTarget::None => {}
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"driver" | b"version" => target = TextTarget::None,
                b"device" => {
                    if let Some(dev) = device.take() {
                        if let Some(driver) = build_driver(dev, family, source) {
                            drivers.push(driver);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DriverError::Catalog {
                    path: Default::default(),
                    reason: format!("{} at byte {}", e, reader.buffer_position()),
                });
            }
        }
    }

    Ok(drivers)
}

fn build_driver(dev: PendingDevice, family: DeviceFamily, source: DriverSource) -> Option<DriverInfo> {
    let Some(name) = dev.name else {
        tracing::warn!("Catalog device {} has no driver name", dev.label);
        return None;
    };
    let Some(version) = dev.version else {
        tracing::warn!("Catalog device {} has no version", dev.label);
        return None;
    };

    let mut driver = DriverInfo::new(&name);
    driver.label = dev.label;
    driver.exec = dev.exec.trim().to_string();
    driver.version = if version.trim().parse::<f64>().is_ok() {
        version.trim().to_string()
    } else {
        "1.0".to_string()
    };
    if let Some(manufacturer) = dev.attrs.get("manufacturer") {
        driver.manufacturer = manufacturer.clone();
    }
    if let Some(skel) = dev.attrs.get("skel") {
        driver.skeleton = skel.clone();
    }
    driver.set_user_port(dev.attrs.get("port").and_then(|p| p.parse().ok()));
    if let Some(mdpd) = dev.attrs.get("mdpd") {
        driver
            .aux
            .insert(AUX_MDPD.to_string(), serde_json::Value::Bool(mdpd == "true"));
    }
    driver.family = family;
    driver.source = source;
    Some(driver)
}

/// Load every catalog in `dir`. The primary catalog is read first; later entries whose
/// label is already known are ignored.
pub fn load_catalog_dir(dir: &Path, server_dir: &Path) -> DriverResult<Vec<DriverInfo>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            !name.ends_with(SKELETON_SUFFIX)
                && (name == PRIMARY_CATALOG || (name.starts_with("indi_") && name.ends_with(".xml")))
        })
        .collect();
    files.sort_by_key(|path| {
        let primary = path.file_name().and_then(|n| n.to_str()) == Some(PRIMARY_CATALOG);
        (!primary, path.clone())
    });

    let mut labels = HashSet::new();
    let mut drivers = Vec::new();

    for path in files {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let source = catalog_source(file_name);
        let xml = match std::fs::read_to_string(&path) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to open INDI driver file {}: {}", path.display(), e);
                continue;
            }
        };

        let parsed = match parse_catalog(&xml, source) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Skipping malformed catalog {}: {}", path.display(), e);
                continue;
            }
        };

        for mut driver in parsed {
            if !labels.insert(driver.label.clone()) {
                continue;
            }
            let available = server_dir.join(&driver.exec).exists();
            driver.aux.insert(
                AUX_LOCALLY_AVAILABLE.to_string(),
                serde_json::Value::Bool(available),
            );
            drivers.push(driver);
        }
    }

    tracing::info!("Loaded {} drivers from {}", drivers.len(), dir.display());
    Ok(drivers)
}

/// Parse a host list
pub fn parse_hosts(xml: &str) -> DriverResult<Vec<DriverInfo>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut hosts = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"INDIHost" => {
                let attrs = attributes(&e);
                let (Some(name), Some(hostname), Some(port)) =
                    (attrs.get("name"), attrs.get("hostname"), attrs.get("port"))
                else {
                    return Err(DriverError::Catalog {
                        path: Default::default(),
                        reason: "INDIHost requires name, hostname and port".to_string(),
                    });
                };
                let mut host = DriverInfo::new(name);
                host.set_host_parameters(hostname, port.parse().ok());
                host.source = DriverSource::Host;
                hosts.push(host);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DriverError::Catalog {
                    path: Default::default(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(hosts)
}

pub fn load_hosts(path: &Path) -> DriverResult<Vec<DriverInfo>> {
    let xml = std::fs::read_to_string(path)?;
    parse_hosts(&xml).map_err(|e| match e {
        DriverError::Catalog { reason, .. } => DriverError::Catalog {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    })
}

/// Write every Host-sourced driver in `drivers` to `path`
pub fn save_hosts<'a, I>(path: &Path, drivers: I) -> DriverResult<()>
where
    I: IntoIterator<Item = &'a DriverInfo>,
{
    let mut out = String::new();
    for host in drivers
        .into_iter()
        .filter(|d| d.source == DriverSource::Host)
    {
        out.push_str(&format!(
            "<INDIHost name='{}' hostname='{}' port='{}' />\n",
            escape(host.name.as_str()),
            escape(host.host.as_str()),
            host.port.map(|p| p.to_string()).unwrap_or_default()
        ));
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// User-defined driver entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDriver {
    pub name: String,
    pub label: String,
    pub exec: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    /// Catalog group label, e.g. "CCDs"
    pub family: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_manufacturer() -> String {
    "Others".to_string()
}

impl CustomDriver {
    pub fn into_driver(self, server_dir: &Path) -> DriverInfo {
        let mut driver = DriverInfo::new(&self.name);
        driver.label = self.label.clone();
        driver.set_unique_label(&self.label);
        driver.exec = self.exec;
        driver.version = self.version;
        driver.manufacturer = self.manufacturer;
        driver.family = DeviceFamily::from_group(&self.family);
        driver.source = DriverSource::Custom;
        driver.aux.insert(
            AUX_LOCALLY_AVAILABLE.to_string(),
            serde_json::Value::Bool(server_dir.join(&driver.exec).exists()),
        );
        driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<driversList>
<devGroup group="Telescopes">
    <device label="Telescope Simulator" manufacturer="Simulators">
        <driver name="Telescope Simulator">indi_simulator_telescope</driver>
        <version>1.0</version>
    </device>
    <device label="EQMod Mount" port="7625">
        <driver name="EQMod Mount">indi_eqmod_telescope</driver>
        <version>beta</version>
    </device>
</devGroup>
<devGroup group="CCDs">
    <device label="CCD Simulator" manufacturer="Simulators" mdpd="true" skel="ccd_sk.xml">
        <driver name="CCD Simulator">indi_simulator_ccd</driver>
        <version>1.2</version>
    </device>
    <device label="Broken">
        <version>1.0</version>
    </device>
</devGroup>
</driversList>"#;

    #[test]
    fn test_parse_catalog() {
        let drivers = parse_catalog(CATALOG, DriverSource::Primary).unwrap();
        assert_eq!(drivers.len(), 3);

        let mount = &drivers[0];
        assert_eq!(mount.exec, "indi_simulator_telescope");
        assert_eq!(mount.family, DeviceFamily::Telescope);
        assert_eq!(mount.manufacturer, "Simulators");

        let eqmod = &drivers[1];
        assert_eq!(eqmod.version, "1.0");
        assert_eq!(eqmod.manufacturer, "Others");
        assert_eq!(eqmod.user_port, Some(7625));

        let ccd = &drivers[2];
        assert!(ccd.is_mdpd());
        assert_eq!(ccd.skeleton, "ccd_sk.xml");
        assert_eq!(ccd.family, DeviceFamily::Ccd);
    }

    #[test]
    fn test_load_catalog_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("drivers.xml"), CATALOG).unwrap();
        std::fs::write(
            dir.path().join("indi_extra.xml"),
            r#"<driversList><devGroup group="Focusers">
                <device label="CCD Simulator"><driver name="Dup">indi_dup</driver><version>1</version></device>
                <device label="Moonlite"><driver name="MoonLite">indi_moonlite_focus</driver><version>1.0</version></device>
            </devGroup></driversList>"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("indi_skel_sk.xml"), "<INDIDriver/>").unwrap();

        let server_dir = tempfile::tempdir().unwrap();
        std::fs::write(server_dir.path().join("indi_moonlite_focus"), "").unwrap();

        let drivers = load_catalog_dir(dir.path(), server_dir.path()).unwrap();
        assert_eq!(drivers.len(), 4);

        let moonlite = drivers.iter().find(|d| d.label == "Moonlite").unwrap();
        assert_eq!(moonlite.source, DriverSource::ThirdParty);
        assert_eq!(moonlite.family, DeviceFamily::Focuser);
        assert_eq!(
            moonlite.aux.get(AUX_LOCALLY_AVAILABLE),
            Some(&serde_json::Value::Bool(true))
        );

        let ccd = drivers.iter().find(|d| d.label == "CCD Simulator").unwrap();
        assert_eq!(ccd.exec, "indi_simulator_ccd");
        assert_eq!(ccd.source, DriverSource::Primary);
    }

    #[test]
    fn test_hosts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indihosts.xml");
        std::fs::write(
            &path,
            "<INDIHost name='Observatory' hostname='192.168.1.20' port='7624' />\n\
             <INDIHost name='Roof' hostname='roof.local' port='7625' />\n",
        )
        .unwrap();

        let hosts = load_hosts(&path).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host, "192.168.1.20");
        assert_eq!(hosts[1].port, Some(7625));
        assert!(hosts.iter().all(|h| h.source == DriverSource::Host));

        let out = dir.path().join("saved.xml");
        save_hosts(&out, hosts.iter()).unwrap();
        let reloaded = load_hosts(&out).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[1].name, "Roof");
    }

    #[test]
    fn test_custom_driver() {
        let custom: CustomDriver = serde_json::from_str(
            r#"{"name": "My Cam", "label": "My Cam", "exec": "indi_mycam", "family": "CCDs"}"#,
        )
        .unwrap();
        let driver = custom.into_driver(Path::new("/nonexistent"));
        assert_eq!(driver.source, DriverSource::Custom);
        assert_eq!(driver.family, DeviceFamily::Ccd);
        assert_eq!(driver.version, "1.0");
        // Unique label is assigned before the source is switched to Custom.
        assert_eq!(driver.unique_label(), "My Cam");
    }
}
