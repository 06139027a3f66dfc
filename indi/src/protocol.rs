//! INDI XML Protocol definitions

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// BLOB delivery policy requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlobMode {
    Never,
    #[default]
    Also,
    Only,
}

impl BlobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }
}

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    /// Driver identification text vector
    pub const DRIVER_INFO: &str = "DRIVER_INFO";
    pub const DRIVER_NAME: &str = "DRIVER_NAME";
    pub const DRIVER_EXEC: &str = "DRIVER_EXEC";

    /// Device port
    pub const DEVICE_PORT: &str = "DEVICE_PORT";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD1: &str = "CCD1";

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const EQUATORIAL_COORD: &str = "EQUATORIAL_COORD";
    pub const HORIZONTAL_COORD: &str = "HORIZONTAL_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const TELESCOPE_TIMED_GUIDE_WE: &str = "TELESCOPE_TIMED_GUIDE_WE";

    // Focuser properties
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_NAME: &str = "FILTER_NAME";

    // Dome properties
    pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
    pub const DOME_MOTION: &str = "DOME_MOTION";

    // Weather properties
    pub const WEATHER_STATUS: &str = "WEATHER_STATUS";

    // Auxiliary
    pub const CAP_PARK: &str = "CAP_PARK";
    pub const FLAT_LIGHT_CONTROL: &str = "FLAT_LIGHT_CONTROL";
}

/// `<getProperties>` request, optionally scoped to one device
pub fn get_properties(version: &str, device: Option<&str>) -> String {
    match device {
        Some(dev) => format!(
            "<getProperties version=\"{}\" device=\"{}\"/>",
            version,
            escape(dev)
        ),
        None => format!("<getProperties version=\"{}\"/>", version),
    }
}

/// `<enableBLOB>` request for a device (and optionally one property)
pub fn enable_blob(device: &str, property: Option<&str>, mode: BlobMode) -> String {
    format!(
        "<enableBLOB device=\"{}\" name=\"{}\">{}</enableBLOB>",
        escape(device),
        escape(property.unwrap_or("")),
        mode.as_str()
    )
}

/// `<newSwitchVector>` carrying every listed element
pub fn new_switch_vector(device: &str, property: &str, elements: &[(String, bool)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, on)| {
            format!(
                "<oneSwitch name=\"{}\">{}</oneSwitch>",
                escape(name.as_str()),
                if *on { "On" } else { "Off" }
            )
        })
        .collect();
    format!(
        "<newSwitchVector device=\"{}\" name=\"{}\">{}</newSwitchVector>",
        escape(device),
        escape(property),
        body
    )
}

/// `<newNumberVector>` carrying every listed element
pub fn new_number_vector(device: &str, property: &str, elements: &[(String, f64)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, value)| {
            format!(
                "<oneNumber name=\"{}\">{}</oneNumber>",
                escape(name.as_str()),
                value
            )
        })
        .collect();
    format!(
        "<newNumberVector device=\"{}\" name=\"{}\">{}</newNumberVector>",
        escape(device),
        escape(property),
        body
    )
}

/// `<newTextVector>` carrying every listed element
pub fn new_text_vector(device: &str, property: &str, elements: &[(String, String)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, value)| {
            format!(
                "<oneText name=\"{}\">{}</oneText>",
                escape(name.as_str()),
                escape(value.as_str())
            )
        })
        .collect();
    format!(
        "<newTextVector device=\"{}\" name=\"{}\">{}</newTextVector>",
        escape(device),
        escape(property),
        body
    )
}

/// Parse an INDI number, accepting sexagesimal `D:M:S` / `D:M` forms
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(v) = text.parse::<f64>() {
        return Some(v);
    }

    let mut parts = text.split([':', ' ']).filter(|p| !p.is_empty());
    let first = parts.next()?;
    let negative = first.starts_with('-');
    let degrees: f64 = first.parse().ok()?;
    let mut value = degrees.abs();
    let mut scale = 60.0;
    for part in parts {
        let v: f64 = part.parse().ok()?;
        value += v / scale;
        scale *= 60.0;
    }
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_vector_escapes_names() {
        let cmd = new_switch_vector(
            "Cam <1>",
            "CONNECTION",
            &[("CONNECT".to_string(), true), ("DISCONNECT".to_string(), false)],
        );
        assert!(cmd.starts_with("<newSwitchVector device=\"Cam &lt;1&gt;\""));
        assert!(cmd.contains("<oneSwitch name=\"CONNECT\">On</oneSwitch>"));
        assert!(cmd.contains("<oneSwitch name=\"DISCONNECT\">Off</oneSwitch>"));
    }

    #[test]
    fn test_enable_blob() {
        assert_eq!(
            enable_blob("CCD Simulator", None, BlobMode::Also),
            "<enableBLOB device=\"CCD Simulator\" name=\"\">Also</enableBLOB>"
        );
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 12.5 "), Some(12.5));
        assert_eq!(parse_number("12:30:00"), Some(12.5));
        assert_eq!(parse_number("-10:30"), Some(-10.5));
        assert_eq!(parse_number("abc"), None);
    }
}
