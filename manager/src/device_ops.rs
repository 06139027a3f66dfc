//! Task-action device adapters
//!
//! Implements the sequencer's device traits on top of the live INDI device registry,
//! so `SetAction` and `EvaluateAction` can drive real devices.

use async_trait::async_trait;
use ekos_drivers::{GenericDevice, IndiListener};
use ekos_indi::{IndiEvent, Property};
use ekos_sequencer::{
    broadcast_stream, DeviceLookup, DeviceResult, PropertyUpdate, SharedTaskDevice, TaskDevice,
};
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;

/// One discovered INDI device seen through the [`TaskDevice`] interface
pub struct IndiTaskDevice {
    device: Arc<GenericDevice>,
}

impl IndiTaskDevice {
    pub fn new(device: Arc<GenericDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl TaskDevice for IndiTaskDevice {
    fn name(&self) -> &str {
        self.device.name()
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn property(&self, name: &str) -> Option<Property> {
        self.device.property(name).await
    }

    async fn send_property(&self, property: &Property) -> DeviceResult<()> {
        tracing::debug!("Sending {}.{}", self.device.name(), property.name);
        self.device
            .send_property(property)
            .await
            .map_err(|e| format!("Send {} failed: {}", property.name, e))
    }

    fn updates(&self) -> BoxStream<'static, PropertyUpdate> {
        let name = self.device.name().to_string();
        broadcast_stream(self.device.client().subscribe())
            .filter_map(move |event| {
                let update = match event {
                    IndiEvent::PropertyUpdated {
                        device,
                        property,
                        state,
                    } if device == name => Some(PropertyUpdate {
                        device,
                        property,
                        state,
                    }),
                    _ => None,
                };
                future::ready(update)
            })
            .boxed()
    }
}

/// Resolves device names against the listener's device list
pub struct ListenerDeviceLookup {
    listener: Arc<IndiListener>,
}

impl ListenerDeviceLookup {
    pub fn new(listener: Arc<IndiListener>) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl DeviceLookup for ListenerDeviceLookup {
    async fn find_device(&self, name: &str) -> Option<SharedTaskDevice> {
        let device = self.listener.find_device(name).await?;
        Some(Arc::new(IndiTaskDevice::new(device)) as SharedTaskDevice)
    }
}
