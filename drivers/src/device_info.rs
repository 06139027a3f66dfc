//! Binding between a driver descriptor and a live device

use crate::generic_device::GenericDevice;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// One device produced by a driver. The handle is weak: its lifetime belongs to the
/// ClientManager session that discovered it.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    name: String,
    driver_id: Uuid,
    device: Weak<GenericDevice>,
}

impl DeviceInfo {
    pub fn new(device: &Arc<GenericDevice>) -> Self {
        Self {
            name: device.name().to_string(),
            driver_id: device.driver_id(),
            device: Arc::downgrade(device),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    /// Live handle, if the session still holds it
    pub fn device(&self) -> Option<Arc<GenericDevice>> {
        self.device.upgrade()
    }
}
