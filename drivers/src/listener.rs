//! Unified device registry across all client sessions
//!
//! The listener is constructed once by the application's composition root and shared
//! as `Arc<IndiListener>`. Each registered [`ClientManager`] gets a forwarding task
//! that folds its events into one device list and one broadcast stream.

use crate::client_manager::{ClientEvent, ClientManager};
use crate::driver_info::DeviceFamily;
use crate::generic_device::{classify_property, GenericDevice};
use ekos_indi::{PropertyKind, PropertyState};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum ListenerEvent {
    NewDevice(Arc<GenericDevice>),
    /// First time a device showed properties of `family`
    DeviceClassified {
        device: String,
        family: DeviceFamily,
    },
    PropertyDefined {
        device: String,
        property: String,
        kind: PropertyKind,
    },
    PropertyUpdated {
        device: String,
        property: String,
        state: PropertyState,
    },
    PropertyRemoved {
        device: String,
        property: String,
    },
    Message {
        device: Option<String>,
        message: String,
    },
    DeviceRemoved(String),
}

struct Registration {
    client: Arc<ClientManager>,
    forwarder: JoinHandle<()>,
}

type DeviceList = Arc<RwLock<Vec<Arc<GenericDevice>>>>;

pub struct IndiListener {
    clients: RwLock<Vec<Registration>>,
    devices: DeviceList,
    event_tx: broadcast::Sender<ListenerEvent>,
}

impl Default for IndiListener {
    fn default() -> Self {
        Self::new()
    }
}

impl IndiListener {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            clients: RwLock::new(Vec::new()),
            devices: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get_devices(&self) -> Vec<Arc<GenericDevice>> {
        self.devices.read().await.clone()
    }

    pub async fn find_device(&self, name: &str) -> Option<Arc<GenericDevice>> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Start following a client session. Devices it discovered before registration
    /// are imported immediately.
    pub async fn add_client(&self, client: Arc<ClientManager>) {
        let mut clients = self.clients.write().await;
        if clients.iter().any(|r| Arc::ptr_eq(&r.client, &client)) {
            return;
        }

        let rx = client.subscribe();
        for device in client.devices().await {
            Self::register_device(&self.devices, &self.event_tx, device.clone()).await;
            for property in device.properties().await {
                Self::classify(&self.devices, &self.event_tx, device.name(), &property.name).await;
            }
        }

        let forwarder = tokio::spawn(Self::forward(
            rx,
            client.clone(),
            self.devices.clone(),
            self.event_tx.clone(),
        ));
        tracing::debug!(
            "Listening to INDI client {}:{}",
            client.host(),
            client.port()
        );
        clients.push(Registration { client, forwarder });
    }

    /// Stop following a client session and drop its devices
    pub async fn remove_client(&self, client: &Arc<ClientManager>) {
        let registration = {
            let mut clients = self.clients.write().await;
            let idx = clients.iter().position(|r| Arc::ptr_eq(&r.client, client));
            idx.map(|i| clients.remove(i))
        };
        if let Some(registration) = registration {
            registration.forwarder.abort();
        }
        Self::drop_client_devices(&self.devices, &self.event_tx, client).await;
    }

    /// Forget every device, e.g. before starting a new profile
    pub async fn reset(&self) {
        self.devices.write().await.clear();
    }

    async fn forward(
        mut rx: broadcast::Receiver<ClientEvent>,
        client: Arc<ClientManager>,
        devices: DeviceList,
        event_tx: broadcast::Sender<ListenerEvent>,
    ) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("INDI listener lagged by {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                ClientEvent::NewDevice { device, .. } => {
                    Self::register_device(&devices, &event_tx, device).await;
                }
                ClientEvent::PropertyDefined {
                    device,
                    property,
                    kind,
                } => {
                    Self::classify(&devices, &event_tx, &device, &property).await;
                    let _ = event_tx.send(ListenerEvent::PropertyDefined {
                        device,
                        property,
                        kind,
                    });
                }
                ClientEvent::PropertyUpdated {
                    device,
                    property,
                    state,
                } => {
                    let _ = event_tx.send(ListenerEvent::PropertyUpdated {
                        device,
                        property,
                        state,
                    });
                }
                ClientEvent::PropertyRemoved { device, property } => {
                    let _ = event_tx.send(ListenerEvent::PropertyRemoved { device, property });
                }
                ClientEvent::Message { device, message } => {
                    let _ = event_tx.send(ListenerEvent::Message { device, message });
                }
                ClientEvent::DeviceRemoved(name) => {
                    let removed = {
                        let mut list = devices.write().await;
                        let before = list.len();
                        list.retain(|d| d.name() != name);
                        before != list.len()
                    };
                    if removed {
                        let _ = event_tx.send(ListenerEvent::DeviceRemoved(name));
                    }
                }
                ClientEvent::ServerDisconnected { .. } => {
                    Self::drop_client_devices(&devices, &event_tx, &client).await;
                }
                // Covered by property classification
                ClientEvent::NewTelescope(_) | ClientEvent::NewCcd(_) => {}
                ClientEvent::BlobReceived { .. } | ClientEvent::ConnectionFailure { .. } => {}
            }
        }
    }

    async fn register_device(
        devices: &DeviceList,
        event_tx: &broadcast::Sender<ListenerEvent>,
        device: Arc<GenericDevice>,
    ) {
        {
            let mut list = devices.write().await;
            if list.iter().any(|d| d.name() == device.name()) {
                return;
            }
            list.push(device.clone());
        }
        tracing::info!("INDI listener: new device {}", device.name());
        let _ = event_tx.send(ListenerEvent::NewDevice(device));
    }

    async fn classify(
        devices: &DeviceList,
        event_tx: &broadcast::Sender<ListenerEvent>,
        device: &str,
        property: &str,
    ) {
        let Some(family) = classify_property(property) else {
            return;
        };
        let handle = devices
            .read()
            .await
            .iter()
            .find(|d| d.name() == device)
            .cloned();
        if let Some(handle) = handle {
            if handle.add_family(family).await {
                tracing::debug!("Device {} classified as {:?}", device, family);
                let _ = event_tx.send(ListenerEvent::DeviceClassified {
                    device: device.to_string(),
                    family,
                });
            }
        }
    }

    async fn drop_client_devices(
        devices: &DeviceList,
        event_tx: &broadcast::Sender<ListenerEvent>,
        client: &Arc<ClientManager>,
    ) {
        let removed: Vec<String> = {
            let mut list = devices.write().await;
            let names = list
                .iter()
                .filter(|d| Arc::ptr_eq(d.client(), client.client()))
                .map(|d| d.name().to_string())
                .collect();
            list.retain(|d| !Arc::ptr_eq(d.client(), client.client()));
            names
        };
        for name in removed {
            let _ = event_tx.send(ListenerEvent::DeviceRemoved(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::{fake_indi_server, TELESCOPE_DEFS};
    use crate::driver_info::DriverInfo;
    use ekos_indi::BlobMode;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_client() -> Arc<ClientManager> {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_secs(5)).await;
        let client = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Also));
        let mut dv = DriverInfo::new("Telescope Simulator");
        dv.exec = "indi_simulator_telescope".to_string();
        client.append_managed_driver(dv.into_handle()).await;
        client
    }

    #[tokio::test]
    async fn test_devices_fan_in_and_classification() {
        let listener = IndiListener::new();
        let mut rx = listener.subscribe();
        let client = connected_client().await;
        listener.add_client(client.clone()).await;
        client.connect_server().await.unwrap();

        let classified = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ListenerEvent::DeviceClassified { device, family }) = rx.recv().await {
                    return (device, family);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            classified,
            ("Telescope Simulator".to_string(), DeviceFamily::Telescope)
        );
        assert!(listener.find_device("Telescope Simulator").await.is_some());
        assert_eq!(listener.client_count().await, 1);

        listener.remove_client(&client).await;
        assert!(listener.get_devices().await.is_empty());
        assert_eq!(listener.client_count().await, 0);
        client.disconnect_server().await;
    }

    #[tokio::test]
    async fn test_late_registration_imports_devices() {
        let listener = IndiListener::new();
        let client = connected_client().await;
        let mut client_rx = client.subscribe();
        client.connect_server().await.unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ClientEvent::NewTelescope(_)) = client_rx.recv().await {
                    return;
                }
            }
        })
        .await
        .unwrap();

        listener.add_client(client.clone()).await;
        let devices = listener.get_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].families().await, vec![DeviceFamily::Telescope]);

        listener.reset().await;
        assert!(listener.get_devices().await.is_empty());
        client.disconnect_server().await;
    }
}
