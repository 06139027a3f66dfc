//! Client sessions to INDI servers
//!
//! A `ClientManager` owns one [`IndiClient`] session to one host:port and routes the
//! wire events for every driver served on that endpoint. Devices announced by the
//! server are matched against the managed drivers and become [`GenericDevice`]s.

use crate::device_info::DeviceInfo;
use crate::driver_info::{DriverHandle, DriverSource};
use crate::error::DriverResult;
use crate::generic_device::GenericDevice;
use crate::server_manager::ServerManager;
use ekos_indi::{
    standard_properties, BlobMode, IndiClient, IndiEvent, IndiResult, Property, PropertyKind,
    PropertyState,
};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Events re-emitted by a client session
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A server device was matched to a managed driver
    NewDevice {
        device: Arc<GenericDevice>,
        driver_id: Uuid,
    },
    /// Device defined `EQUATORIAL_EOD_COORD`
    NewTelescope(String),
    /// Device defined `CCD_EXPOSURE`
    NewCcd(String),
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
    BlobReceived {
        device: String,
        property: String,
        element: String,
        format: String,
        data: Arc<Vec<u8>>,
    },
    DeviceRemoved(String),
    /// Session closed; negative exit codes mean the server went away
    ServerDisconnected {
        host: String,
        port: u16,
        exit_code: i32,
    },
    /// Session closed abnormally
    ConnectionFailure { host: String, port: u16 },
}

pub struct ClientManager {
    id: Uuid,
    host: String,
    port: u16,
    client: Arc<IndiClient>,
    blob_mode: BlobMode,
    /// Endpoint of the local server this session is paired with
    server_endpoint: Option<(String, u16)>,
    managed: RwLock<Vec<DriverHandle>>,
    devices: RwLock<Vec<Arc<GenericDevice>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl ClientManager {
    pub fn new(host: &str, port: u16, blob_mode: BlobMode) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            port,
            client: Arc::new(IndiClient::new(host, Some(port))),
            blob_mode,
            server_endpoint: None,
            managed: RwLock::new(Vec::new()),
            devices: RwLock::new(Vec::new()),
            pump: Mutex::new(None),
            event_tx,
        }
    }

    /// Pair with the local server whose drivers this session serves
    pub fn paired_with(mut self, server: &ServerManager) -> Self {
        self.server_endpoint = Some((server.host().to_string(), server.port()));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client(&self) -> &Arc<IndiClient> {
        &self.client
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    // =========================================================================
    // MANAGED DRIVERS
    // =========================================================================

    pub async fn append_managed_driver(&self, driver: DriverHandle) {
        driver.write().await.set_client_manager(Some(self.id));
        let mut managed = self.managed.write().await;
        if !managed.iter().any(|d| Arc::ptr_eq(d, &driver)) {
            managed.push(driver);
        }
    }

    /// Detach a driver and drop the devices it produced
    pub async fn remove_managed_driver(&self, driver: &DriverHandle) {
        self.managed
            .write()
            .await
            .retain(|d| !Arc::ptr_eq(d, driver));

        let driver_id = {
            let mut dv = driver.write().await;
            dv.clear_devices();
            dv.set_client_state(false);
            dv.set_client_manager(None);
            dv.id()
        };

        let removed: Vec<String> = {
            let mut devices = self.devices.write().await;
            let names = devices
                .iter()
                .filter(|d| d.driver_id() == driver_id)
                .map(|d| d.name().to_string())
                .collect();
            devices.retain(|d| d.driver_id() != driver_id);
            names
        };
        for name in removed {
            let _ = self.event_tx.send(ClientEvent::DeviceRemoved(name));
        }
    }

    pub async fn count(&self) -> usize {
        self.managed.read().await.len()
    }

    pub async fn managed_drivers(&self) -> Vec<DriverHandle> {
        self.managed.read().await.clone()
    }

    pub async fn devices(&self) -> Vec<Arc<GenericDevice>> {
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

    // =========================================================================
    // SESSION
    // =========================================================================

    /// One connection attempt. On success the session's events start flowing.
    pub async fn connect_server(self: &Arc<Self>) -> DriverResult<()> {
        let rx = self.client.subscribe();
        self.client.connect().await?;
        self.server_connected().await;

        let pump = tokio::spawn(Self::pump(Arc::downgrade(self), rx));
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }
        Ok(())
    }

    pub async fn disconnect_server(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        if self.client.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                tracing::warn!("Error disconnecting from {}:{}: {}", self.host, self.port, e);
            }
            self.server_disconnected(0).await;
        }
    }

    async fn pump(this: Weak<Self>, mut rx: broadcast::Receiver<IndiEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("INDI client event pump lagged by {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(manager) = this.upgrade() else {
                break;
            };
            let disconnected = matches!(event, IndiEvent::ServerDisconnected { .. });
            manager.handle_event(event).await;
            if disconnected {
                break;
            }
        }
    }

    async fn handle_event(&self, event: IndiEvent) {
        match event {
            IndiEvent::DeviceDefined(name) => self.new_device(&name).await,
            IndiEvent::PropertyDefined {
                device,
                property,
                kind,
            } => {
                if property == standard_properties::EQUATORIAL_EOD_COORD {
                    let _ = self.event_tx.send(ClientEvent::NewTelescope(device.clone()));
                } else if property == standard_properties::CCD_EXPOSURE {
                    let _ = self.event_tx.send(ClientEvent::NewCcd(device.clone()));
                }
                let _ = self.event_tx.send(ClientEvent::PropertyDefined {
                    device,
                    property,
                    kind,
                });
            }
            IndiEvent::PropertyUpdated {
                device,
                property,
                state,
            } => {
                let _ = self.event_tx.send(ClientEvent::PropertyUpdated {
                    device,
                    property,
                    state,
                });
            }
            IndiEvent::PropertyDeleted { device, property } => {
                let _ = self
                    .event_tx
                    .send(ClientEvent::PropertyRemoved { device, property });
            }
            IndiEvent::DeviceRemoved(name) => self.remove_device(&name).await,
            IndiEvent::Message { device, message } => {
                let _ = self.event_tx.send(ClientEvent::Message { device, message });
            }
            IndiEvent::BlobReceived {
                device,
                property,
                element,
                data,
                format,
                ..
            } => {
                let _ = self.event_tx.send(ClientEvent::BlobReceived {
                    device,
                    property,
                    element,
                    format,
                    data: Arc::new(data),
                });
            }
            IndiEvent::ServerDisconnected { exit_code } => {
                self.server_disconnected(exit_code).await;
            }
            IndiEvent::Error(e) => {
                tracing::warn!("INDI session {}:{} error: {}", self.host, self.port, e);
            }
            IndiEvent::ConnectionStateChanged(_) => {}
        }
    }

    async fn new_device(&self, name: &str) {
        if let Err(e) = self.client.enable_blob(name, self.blob_mode).await {
            tracing::warn!("Failed to enable BLOBs for {}: {}", name, e);
        }

        let lowered = name.to_lowercase();
        let managed = self.managed.read().await.clone();
        for driver in managed {
            let mut dv = driver.write().await;
            let matched = dv.unique_label() == name
                || (!dv.name.is_empty() && lowered.starts_with(&dv.name.to_lowercase()))
                || matches!(dv.source, DriverSource::Host | DriverSource::Generated);
            if !matched {
                continue;
            }

            let device = Arc::new(GenericDevice::new(name, dv.id(), self.client.clone()));
            dv.add_device(DeviceInfo::new(&device));
            let driver_id = dv.id();
            drop(dv);

            self.devices.write().await.push(device.clone());
            tracing::info!(
                "INDI device {} discovered on {}:{}",
                name,
                self.host,
                self.port
            );
            let _ = self
                .event_tx
                .send(ClientEvent::NewDevice { device, driver_id });
            return;
        }

        tracing::debug!(
            "Device {} on {}:{} matches no managed driver",
            name,
            self.host,
            self.port
        );
    }

    async fn remove_device(&self, name: &str) {
        let removed = {
            let mut devices = self.devices.write().await;
            let idx = devices.iter().position(|d| d.name() == name);
            idx.map(|i| devices.remove(i))
        };
        let Some(device) = removed else {
            return;
        };

        for driver in self.managed.read().await.iter() {
            let mut dv = driver.write().await;
            if dv.id() == device.driver_id() {
                dv.remove_device(name);
            }
        }
        let _ = self
            .event_tx
            .send(ClientEvent::DeviceRemoved(name.to_string()));
    }

    /// Mark managed drivers client-active and sync them with the paired server
    pub async fn server_connected(&self) {
        tracing::info!("Connected to INDI server {}:{}", self.host, self.port);
        for driver in self.managed.read().await.iter() {
            let mut dv = driver.write().await;
            dv.set_client_state(true);
            if let Some((host, port)) = &self.server_endpoint {
                dv.set_host_parameters(host, Some(*port));
            }
        }
    }

    pub async fn server_disconnected(&self, exit_code: i32) {
        for driver in self.managed.read().await.iter() {
            let mut dv = driver.write().await;
            dv.set_client_state(false);
            dv.clear_devices();
        }
        self.devices.write().await.clear();

        let _ = self.event_tx.send(ClientEvent::ServerDisconnected {
            host: self.host.clone(),
            port: self.port,
            exit_code,
        });

        if exit_code < 0 {
            tracing::warn!(
                "INDI server {}:{} disconnected unexpectedly",
                self.host,
                self.port
            );
            let _ = self.event_tx.send(ClientEvent::ConnectionFailure {
                host: self.host.clone(),
                port: self.port,
            });
        }
    }

    pub async fn send_new_property(&self, property: &Property) -> IndiResult<()> {
        self.client.send_new_property(property).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver_info::DriverInfo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    pub(crate) const TELESCOPE_DEFS: &str = r#"
<defTextVector device="Telescope Simulator" name="DRIVER_INFO" state="Idle" perm="ro">
    <defText name="DRIVER_NAME">Telescope Simulator</defText>
    <defText name="DRIVER_EXEC">indi_simulator_telescope</defText>
</defTextVector>
<defSwitchVector device="Telescope Simulator" name="CONNECTION" state="Idle" perm="rw" rule="OneOfMany">
    <defSwitch name="CONNECT">Off</defSwitch>
    <defSwitch name="DISCONNECT">On</defSwitch>
</defSwitchVector>
<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" state="Idle" perm="rw">
    <defNumber name="RA" min="0" max="24">0</defNumber>
    <defNumber name="DEC" min="-90" max="90">90</defNumber>
</defNumberVector>
<defNumberVector device="Unknown Gadget" name="POWER" state="Idle" perm="rw">
    <defNumber name="VALUE">1</defNumber>
</defNumberVector>
"#;

    /// Minimal INDI server: sends `script` to each client, then holds the socket
    /// open until `hold` elapses.
    pub(crate) async fn fake_indi_server(script: &'static str, hold: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    // Wait for getProperties
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(script.as_bytes()).await;
                    let _ = timeout(hold, async {
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    })
                    .await;
                });
            }
        });
        port
    }

    fn telescope_driver() -> DriverHandle {
        let mut dv = DriverInfo::new("Telescope Simulator");
        dv.label = "Telescope Simulator".to_string();
        dv.exec = "indi_simulator_telescope".to_string();
        dv.into_handle()
    }

    async fn next_new_device(rx: &mut broadcast::Receiver<ClientEvent>) -> Arc<GenericDevice> {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ClientEvent::NewDevice { device, .. }) = rx.recv().await {
                    return device;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_devices_matched_by_driver_name() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_secs(5)).await;
        let manager = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Also));
        let driver = telescope_driver();
        manager.append_managed_driver(driver.clone()).await;

        let mut rx = manager.subscribe();
        manager.connect_server().await.unwrap();
        assert!(driver.read().await.client_state());

        let device = next_new_device(&mut rx).await;
        assert_eq!(device.name(), "Telescope Simulator");
        assert_eq!(device.driver_id(), driver.read().await.id());

        let telescope = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ClientEvent::NewTelescope(name)) = rx.recv().await {
                    return name;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(telescope, "Telescope Simulator");

        // Unknown Gadget has no managed driver
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.devices().await.len(), 1);
        assert_eq!(driver.read().await.devices().len(), 1);

        manager.disconnect_server().await;
        assert!(!driver.read().await.client_state());
        assert!(driver.read().await.devices().is_empty());
        assert!(manager.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_host_driver_catches_all_devices() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_secs(5)).await;
        let manager = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Never));
        let mut host = DriverInfo::new("Observatory");
        host.source = DriverSource::Host;
        let host = host.into_handle();
        manager.append_managed_driver(host.clone()).await;

        let mut rx = manager.subscribe();
        manager.connect_server().await.unwrap();
        next_new_device(&mut rx).await;
        next_new_device(&mut rx).await;
        assert_eq!(host.read().await.devices().len(), 2);
        manager.disconnect_server().await;
    }

    #[tokio::test]
    async fn test_server_drop_reports_connection_failure() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_millis(200)).await;
        let manager = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Also));
        let driver = telescope_driver();
        manager.append_managed_driver(driver.clone()).await;

        let mut rx = manager.subscribe();
        manager.connect_server().await.unwrap();

        let failure = timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(ClientEvent::ConnectionFailure { port, .. }) = rx.recv().await {
                    return port;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failure, port);
        assert!(!driver.read().await.client_state());
    }

    #[tokio::test]
    async fn test_remove_managed_driver_drops_devices() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_secs(5)).await;
        let manager = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Also));
        let driver = telescope_driver();
        manager.append_managed_driver(driver.clone()).await;

        let mut rx = manager.subscribe();
        manager.connect_server().await.unwrap();
        next_new_device(&mut rx).await;

        manager.remove_managed_driver(&driver).await;
        assert_eq!(manager.count().await, 0);
        assert!(manager.find_device("Telescope Simulator").await.is_none());
        assert!(driver.read().await.client_manager().is_none());
        manager.disconnect_server().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = Arc::new(ClientManager::new("127.0.0.1", port, BlobMode::Also));
        assert!(manager.connect_server().await.is_err());
        assert!(!manager.is_connected());
    }
}
