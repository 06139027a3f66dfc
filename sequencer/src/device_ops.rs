//! Device Operations Trait
//!
//! This module defines the interface task actions need from a device.
//! The actual implementation is provided by the manager crate on top of the live
//! INDI device registry.

use async_trait::async_trait;
use ekos_indi::{Property, PropertyState};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// A property of a device changed on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub device: String,
    pub property: String,
    pub state: PropertyState,
}

/// One device as seen by a task action
#[async_trait]
pub trait TaskDevice: Send + Sync {
    fn name(&self) -> &str;

    async fn is_connected(&self) -> bool;

    /// Current cached copy of a property
    async fn property(&self, name: &str) -> Option<Property>;

    /// Send a locally modified property to the device
    async fn send_property(&self, property: &Property) -> DeviceResult<()>;

    /// Live property updates for this device, starting now
    fn updates(&self) -> BoxStream<'static, PropertyUpdate>;
}

/// Shared handle to a task device
pub type SharedTaskDevice = Arc<dyn TaskDevice>;

/// Resolves device names for task actions
#[async_trait]
pub trait DeviceLookup: Send + Sync {
    async fn find_device(&self, name: &str) -> Option<SharedTaskDevice>;
}

/// Shared handle to a device lookup
pub type SharedDeviceLookup = Arc<dyn DeviceLookup>;

/// Lookup that knows no devices
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeviceLookup;

#[async_trait]
impl DeviceLookup for NullDeviceLookup {
    async fn find_device(&self, name: &str) -> Option<SharedTaskDevice> {
        tracing::debug!("[NULL] No device named {}", name);
        None
    }
}

/// Turn a broadcast receiver into a stream; lagged messages are skipped
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Property update stream lagged by {} messages", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory device used by the action tests

    use super::*;
    use ekos_indi::{Element, ElementValue, PropertyKind, SwitchRule};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the device does with a property it accepted
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Reaction {
        /// Apply the values, go Ok and announce the update
        Apply,
        /// Apply the values and go Ok without announcing it
        ApplySilently,
        /// Keep the old values and go Alert
        Alert,
        /// Keep the old values and stay Busy
        Busy,
    }

    pub struct MockDevice {
        name: String,
        connected: AtomicBool,
        properties: Mutex<HashMap<String, Property>>,
        reaction: Mutex<Reaction>,
        failing_sends: AtomicUsize,
        send_attempts: AtomicUsize,
        sent: Mutex<Vec<Property>>,
        updates_tx: broadcast::Sender<PropertyUpdate>,
    }

    impl MockDevice {
        pub fn new(name: &str) -> Arc<Self> {
            let (updates_tx, _) = broadcast::channel(64);
            Arc::new(Self {
                name: name.to_string(),
                connected: AtomicBool::new(true),
                properties: Mutex::new(HashMap::new()),
                reaction: Mutex::new(Reaction::Apply),
                failing_sends: AtomicUsize::new(0),
                send_attempts: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                updates_tx,
            })
        }

        pub fn with_number(self: Arc<Self>, property: &str, element: &str, value: f64) -> Arc<Self> {
            let mut prop = self.take_or_new(property, PropertyKind::Number);
            prop.upsert_element(Element {
                name: element.to_string(),
                label: element.to_string(),
                value: ElementValue::Number {
                    value,
                    min: -1000.0,
                    max: 1000.0,
                    step: 0.0,
                    format: "%g".to_string(),
                },
            });
            self.put(prop);
            self
        }

        pub fn with_switches(
            self: Arc<Self>,
            property: &str,
            rule: SwitchRule,
            elements: &[(&str, bool)],
        ) -> Arc<Self> {
            let mut prop = self.take_or_new(property, PropertyKind::Switch);
            prop.rule = Some(rule);
            for (name, on) in elements {
                prop.upsert_element(Element {
                    name: name.to_string(),
                    label: name.to_string(),
                    value: ElementValue::Switch(*on),
                });
            }
            self.put(prop);
            self
        }

        pub fn with_text(self: Arc<Self>, property: &str, element: &str, value: &str) -> Arc<Self> {
            let mut prop = self.take_or_new(property, PropertyKind::Text);
            prop.upsert_element(Element {
                name: element.to_string(),
                label: element.to_string(),
                value: ElementValue::Text(value.to_string()),
            });
            self.put(prop);
            self
        }

        pub fn with_light(self: Arc<Self>, property: &str, element: &str, state: PropertyState) -> Arc<Self> {
            let mut prop = self.take_or_new(property, PropertyKind::Light);
            prop.upsert_element(Element {
                name: element.to_string(),
                label: element.to_string(),
                value: ElementValue::Light(state),
            });
            self.put(prop);
            self
        }

        fn take_or_new(&self, property: &str, kind: PropertyKind) -> Property {
            self.properties
                .lock()
                .unwrap()
                .remove(property)
                .unwrap_or_else(|| Property::new(&self.name, property, kind))
        }

        fn put(&self, property: Property) {
            self.properties
                .lock()
                .unwrap()
                .insert(property.name.clone(), property);
        }

        pub fn set_reaction(&self, reaction: Reaction) {
            *self.reaction.lock().unwrap() = reaction;
        }

        pub fn fail_next_sends(&self, count: usize) {
            self.failing_sends.store(count, Ordering::SeqCst);
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub fn send_attempts(&self) -> usize {
            self.send_attempts.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<Property> {
            self.sent.lock().unwrap().clone()
        }

        /// Change the cached state of a property and announce it
        pub fn push_state(&self, property: &str, state: PropertyState) {
            if let Some(prop) = self.properties.lock().unwrap().get_mut(property) {
                prop.state = state;
            }
            let _ = self.updates_tx.send(PropertyUpdate {
                device: self.name.clone(),
                property: property.to_string(),
                state,
            });
        }

        /// Change a cached number and announce the property as Ok
        pub fn push_number(&self, property: &str, element: &str, value: f64) {
            if let Some(prop) = self.properties.lock().unwrap().get_mut(property) {
                if let Some(el) = prop.element_mut(element) {
                    el.value.apply_text(&value.to_string());
                }
            }
            self.push_state(property, PropertyState::Ok);
        }
    }

    #[async_trait]
    impl TaskDevice for MockDevice {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn property(&self, name: &str) -> Option<Property> {
            self.properties.lock().unwrap().get(name).cloned()
        }

        async fn send_property(&self, property: &Property) -> DeviceResult<()> {
            self.send_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_sends.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_sends.store(failing - 1, Ordering::SeqCst);
                return Err("socket closed".to_string());
            }
            self.sent.lock().unwrap().push(property.clone());

            let reaction = *self.reaction.lock().unwrap();
            let state = match reaction {
                Reaction::Apply | Reaction::ApplySilently => {
                    let mut applied = property.clone();
                    applied.state = PropertyState::Ok;
                    self.put(applied);
                    PropertyState::Ok
                }
                Reaction::Alert => PropertyState::Alert,
                Reaction::Busy => PropertyState::Busy,
            };
            if reaction == Reaction::ApplySilently {
                return Ok(());
            }
            self.push_state(&property.name, state);
            Ok(())
        }

        fn updates(&self) -> BoxStream<'static, PropertyUpdate> {
            broadcast_stream(self.updates_tx.subscribe())
        }
    }

    pub struct MockLookup {
        devices: Vec<Arc<MockDevice>>,
    }

    impl MockLookup {
        pub fn new(devices: Vec<Arc<MockDevice>>) -> Arc<Self> {
            Arc::new(Self { devices })
        }
    }

    #[async_trait]
    impl DeviceLookup for MockLookup {
        async fn find_device(&self, name: &str) -> Option<SharedTaskDevice> {
            self.devices
                .iter()
                .find(|d| d.name == name)
                .map(|d| d.clone() as SharedTaskDevice)
        }
    }
}
