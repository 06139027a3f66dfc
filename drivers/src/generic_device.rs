//! Live device handle
//!
//! A `GenericDevice` is created by a ClientManager when the server announces a device.
//! It holds the session it arrived on and the families inferred from its properties.

use crate::driver_info::DeviceFamily;
use ekos_indi::{standard_properties, IndiClient, IndiResult, Property};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct GenericDevice {
    name: String,
    driver_id: Uuid,
    client: Arc<IndiClient>,
    families: RwLock<HashSet<DeviceFamily>>,
}

impl fmt::Debug for GenericDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericDevice")
            .field("name", &self.name)
            .field("driver_id", &self.driver_id)
            .field("endpoint", &format!("{}:{}", self.client.host(), self.client.port()))
            .finish()
    }
}

impl GenericDevice {
    pub fn new(name: &str, driver_id: Uuid, client: Arc<IndiClient>) -> Self {
        Self {
            name: name.to_string(),
            driver_id,
            client,
            families: RwLock::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the [`crate::DriverInfo`] this device was matched to
    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    pub fn client(&self) -> &Arc<IndiClient> {
        &self.client
    }

    pub async fn connect(&self) -> IndiResult<()> {
        tracing::debug!("Connecting device {}", self.name);
        self.client.connect_device(&self.name).await
    }

    pub async fn disconnect(&self) -> IndiResult<()> {
        tracing::debug!("Disconnecting device {}", self.name);
        self.client.disconnect_device(&self.name).await
    }

    pub async fn is_connected(&self) -> bool {
        self.client.is_device_connected(&self.name).await
    }

    pub async fn property(&self, name: &str) -> Option<Property> {
        self.client.get_property(&self.name, name).await
    }

    pub async fn properties(&self) -> Vec<Property> {
        self.client.get_properties(&self.name).await
    }

    pub async fn send_property(&self, property: &Property) -> IndiResult<()> {
        self.client.send_new_property(property).await
    }

    /// `DRIVER_INFO.DRIVER_NAME` as published by the driver
    pub async fn driver_name(&self) -> Option<String> {
        self.client
            .get_device(&self.name)
            .await
            .and_then(|d| d.driver_name)
    }

    /// Record a family; returns true the first time it is seen
    pub async fn add_family(&self, family: DeviceFamily) -> bool {
        self.families.write().await.insert(family)
    }

    pub async fn families(&self) -> Vec<DeviceFamily> {
        self.families.read().await.iter().copied().collect()
    }
}

/// Family implied by a property name, if it is one of the interface markers
pub fn classify_property(name: &str) -> Option<DeviceFamily> {
    use standard_properties::*;

    match name {
        ON_COORD_SET | EQUATORIAL_EOD_COORD | EQUATORIAL_COORD | HORIZONTAL_COORD => {
            Some(DeviceFamily::Telescope)
        }
        CCD_EXPOSURE => Some(DeviceFamily::Ccd),
        FILTER_NAME => Some(DeviceFamily::Filter),
        FOCUS_MOTION => Some(DeviceFamily::Focuser),
        DOME_SHUTTER | DOME_MOTION => Some(DeviceFamily::Dome),
        WEATHER_STATUS => Some(DeviceFamily::Weather),
        CAP_PARK => Some(DeviceFamily::DustCap),
        FLAT_LIGHT_CONTROL => Some(DeviceFamily::LightBox),
        TELESCOPE_TIMED_GUIDE_WE => Some(DeviceFamily::St4),
        _ => None,
    }
}
