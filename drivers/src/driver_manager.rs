//! Top-level driver orchestration
//!
//! `DriverManager` owns the driver roster and the active server/client managers.
//! Requested drivers are grouped by host:port; each group gets one local server and
//! one client session. Group start is all-or-nothing, and the first failing group
//! aborts the whole batch.

use crate::catalog::{self, CustomDriver};
use crate::client_manager::{ClientEvent, ClientManager};
use crate::config::DriverManagerConfig;
use crate::driver_info::{DriverHandle, DriverInfo};
use crate::error::{DriverError, DriverResult};
use crate::listener::IndiListener;
use crate::ports::PortAllocator;
use crate::server_manager::{ServerEvent, ServerManager};
use ekos_indi::INDI_DEFAULT_PORT;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::sleep;

/// Asked before a running driver is restarted as part of a new start request
pub trait RestartPrompt: Send + Sync {
    fn confirm_restart(&self, driver_label: &str) -> bool;
}

/// Prompt that always agrees
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRestart;

impl RestartPrompt for AlwaysRestart {
    fn confirm_restart(&self, _driver_label: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverManagerEvent {
    /// A server process or client session for `host:port` went away
    ServerTerminated { host: String, port: u16 },
    ConnectionFailure { host: String, port: u16 },
    DriverCrashed {
        host: String,
        port: u16,
        driver: String,
    },
}

pub struct DriverManager {
    config: Arc<DriverManagerConfig>,
    listener: Arc<IndiListener>,
    prompt: Arc<dyn RestartPrompt>,
    drivers: RwLock<Vec<DriverHandle>>,
    servers: RwLock<Vec<Arc<ServerManager>>>,
    clients: RwLock<Vec<Arc<ClientManager>>>,
    ports: Mutex<PortAllocator>,
    event_tx: broadcast::Sender<DriverManagerEvent>,
}

impl DriverManager {
    pub fn new(config: DriverManagerConfig, listener: Arc<IndiListener>) -> Arc<Self> {
        Self::with_prompt(config, listener, Arc::new(AlwaysRestart))
    }

    pub fn with_prompt(
        config: DriverManagerConfig,
        listener: Arc<IndiListener>,
        prompt: Arc<dyn RestartPrompt>,
    ) -> Arc<Self> {
        let ports = PortAllocator::new(config.server_port_start, config.server_port_end);
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            config: Arc::new(config),
            listener,
            prompt,
            drivers: RwLock::new(Vec::new()),
            servers: RwLock::new(Vec::new()),
            clients: RwLock::new(Vec::new()),
            ports: Mutex::new(ports),
            event_tx,
        })
    }

    pub fn config(&self) -> &DriverManagerConfig {
        &self.config
    }

    pub fn listener(&self) -> &Arc<IndiListener> {
        &self.listener
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverManagerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn servers(&self) -> Vec<Arc<ServerManager>> {
        self.servers.read().await.clone()
    }

    pub async fn clients(&self) -> Vec<Arc<ClientManager>> {
        self.clients.read().await.clone()
    }

    // =========================================================================
    // ROSTER
    // =========================================================================

    /// Add a driver to the roster unless its label is already known
    pub async fn add_driver(&self, driver: DriverInfo) -> DriverHandle {
        if let Some(existing) = self.find_driver_by_label(&driver.label).await {
            if !driver.label.is_empty() {
                return existing;
            }
        }
        let handle = driver.into_handle();
        self.drivers.write().await.push(handle.clone());
        handle
    }

    /// Load every catalog in the drivers directory; returns the number added
    pub async fn load_catalog(&self) -> DriverResult<usize> {
        let drivers =
            catalog::load_catalog_dir(&self.config.drivers_dir, &self.config.server_dir())?;
        let mut added = 0;
        for driver in drivers {
            if self.find_driver_by_label(&driver.label).await.is_none() {
                self.drivers.write().await.push(driver.into_handle());
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn load_hosts(&self, path: &Path) -> DriverResult<usize> {
        let hosts = catalog::load_hosts(path)?;
        let count = hosts.len();
        let mut roster = self.drivers.write().await;
        roster.extend(hosts.into_iter().map(DriverInfo::into_handle));
        Ok(count)
    }

    pub async fn save_hosts(&self, path: &Path) -> DriverResult<()> {
        let mut snapshot = Vec::new();
        for driver in self.drivers.read().await.iter() {
            snapshot.push(driver.read().await.clone());
        }
        catalog::save_hosts(path, snapshot.iter())
    }

    pub async fn add_custom_drivers(&self, custom: Vec<CustomDriver>) -> usize {
        let server_dir = self.config.server_dir();
        let mut added = 0;
        for entry in custom {
            if self.find_driver_by_label(&entry.label).await.is_some() {
                continue;
            }
            self.drivers
                .write()
                .await
                .push(entry.into_driver(&server_dir).into_handle());
            added += 1;
        }
        added
    }

    async fn find_driver<F>(&self, pred: F) -> Option<DriverHandle>
    where
        F: Fn(&DriverInfo) -> bool,
    {
        for driver in self.drivers.read().await.iter() {
            if pred(&*driver.read().await) {
                return Some(driver.clone());
            }
        }
        None
    }

    pub async fn find_driver_by_name(&self, name: &str) -> Option<DriverHandle> {
        self.find_driver(|d| d.name == name).await
    }

    pub async fn find_driver_by_label(&self, label: &str) -> Option<DriverHandle> {
        self.find_driver(|d| d.label == label).await
    }

    pub async fn find_driver_by_exec(&self, exec: &str) -> Option<DriverHandle> {
        self.find_driver(|d| d.exec == exec).await
    }

    /// Roster as a JSON array of driver summaries
    pub async fn driver_list(&self) -> serde_json::Value {
        let mut summaries = Vec::new();
        for driver in self.drivers.read().await.iter() {
            summaries.push(driver.read().await.to_summary());
        }
        serde_json::to_value(summaries).unwrap_or(serde_json::Value::Null)
    }

    // =========================================================================
    // PORTS AND LABELS
    // =========================================================================

    pub async fn get_indi_port(&self, custom: Option<u16>) -> DriverResult<u16> {
        self.ports.lock().await.allocate(custom)
    }

    /// `label`, or `"<label> <n+1>"` when `n` live devices already use it
    pub async fn get_unique_device_label(&self, label: &str) -> String {
        let mut nset = 0;
        for client in self.clients.read().await.iter() {
            nset += client
                .devices()
                .await
                .iter()
                .filter(|d| d.name() == label)
                .count();
        }
        if nset > 0 {
            format!("{} {}", label, nset + 1)
        } else {
            label.to_string()
        }
    }

    // =========================================================================
    // START / STOP
    // =========================================================================

    /// Partition drivers by (host, port). Running drivers are stopped first once the
    /// restart prompt agrees.
    pub async fn get_unique_hosts(
        &self,
        drivers: &[DriverHandle],
    ) -> DriverResult<Vec<Vec<DriverHandle>>> {
        let mut groups: Vec<(String, Option<u16>, Vec<DriverHandle>)> = Vec::new();

        for driver in drivers {
            if groups
                .iter()
                .any(|(_, _, group)| group.iter().any(|d| Arc::ptr_eq(d, driver)))
            {
                continue;
            }

            let (active, label, host, port) = {
                let dv = driver.read().await;
                (
                    dv.is_active(),
                    dv.display_label().to_string(),
                    dv.host.clone(),
                    dv.port,
                )
            };

            if active {
                if !self.prompt.confirm_restart(&label) {
                    return Err(DriverError::RestartDeclined(label));
                }
                self.stop_devices(std::slice::from_ref(driver)).await;
            }

            match groups
                .iter_mut()
                .find(|(h, p, _)| *h == host && *p == port)
            {
                Some((_, _, group)) => group.push(driver.clone()),
                None => groups.push((host, port, vec![driver.clone()])),
            }
        }

        Ok(groups.into_iter().map(|(_, _, group)| group).collect())
    }

    /// Start local servers and client sessions for `drivers`
    pub async fn start_devices(self: &Arc<Self>, drivers: &[DriverHandle]) -> DriverResult<()> {
        let groups = self.get_unique_hosts(drivers).await?;

        for group in groups {
            let Some(first) = group.first() else {
                continue;
            };
            let (host, requested_port) = {
                let dv = first.read().await;
                (dv.host.clone(), dv.port)
            };

            let port = self.get_indi_port(requested_port).await.map_err(|e| {
                tracing::error!("Cannot start INDI server: port error: {}", e);
                e
            })?;

            let server = Arc::new(ServerManager::new(&host, port, self.config.clone()));
            let server_rx = server.subscribe();
            server.start().await?;
            self.servers.write().await.push(server.clone());
            self.watch_server(server_rx);
            tracing::info!("INDI server started locally on port {}", port);

            for driver in &group {
                let pending_label = {
                    let dv = driver.read().await;
                    (dv.unique_label().is_empty() && !dv.label.is_empty())
                        .then(|| dv.label.clone())
                };
                if let Some(label) = pending_label {
                    let unique = self.get_unique_device_label(&label).await;
                    driver.write().await.set_unique_label(&unique);
                }

                if let Err(e) = server.start_driver(driver).await {
                    tracing::error!("Aborting start on {}:{}: {}", host, port, e);
                    server.stop().await;
                    self.remove_server(&server).await;

                    let mut labels = Vec::with_capacity(group.len());
                    for dv in &group {
                        let mut dv = dv.write().await;
                        dv.reset();
                        dv.port = dv.user_port;
                        labels.push(dv.display_label().to_string());
                    }
                    return Err(DriverError::GroupStartFailed {
                        host,
                        port,
                        drivers: labels,
                        reason: e.to_string(),
                    });
                }
            }

            if self.config.server_only {
                continue;
            }

            let client = Arc::new(
                ClientManager::new(&host, port, self.config.blob_mode).paired_with(&server),
            );
            for driver in &group {
                client.append_managed_driver(driver.clone()).await;
            }

            let client_rx = client.subscribe();
            tracing::info!("Connecting to local INDI server on port {} ...", port);
            if let Err(e) = self.connect_with_retry(&client).await {
                let mut failed = Vec::new();
                for driver in &group {
                    client.remove_managed_driver(driver).await;
                    failed.push(driver.read().await.display_label().to_string());
                }
                tracing::error!(
                    "Connection to INDI server locally on port {} failed; could not establish: {}",
                    port,
                    failed.join(", ")
                );
                return Err(e);
            }

            self.clients.write().await.push(client.clone());
            self.listener.add_client(client.clone()).await;
            self.watch_client(client_rx);
        }

        Ok(())
    }

    async fn connect_with_retry(&self, client: &Arc<ClientManager>) -> DriverResult<()> {
        let attempts = self.config.max_connect_tries.max(1);
        for attempt in 1..=attempts {
            match client.connect_server().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        "Connection attempt {}/{} to {}:{} failed: {}",
                        attempt,
                        attempts,
                        client.host(),
                        client.port(),
                        e
                    );
                    if attempt < attempts {
                        sleep(self.config.connect_retry_delay()).await;
                    }
                }
            }
        }
        Err(DriverError::ConnectionFailed {
            host: client.host().to_string(),
            port: client.port(),
            attempts,
        })
    }

    /// Two-phase teardown: client sessions first, then servers
    pub async fn stop_devices(&self, drivers: &[DriverHandle]) {
        for driver in drivers {
            let Some(id) = driver.read().await.client_manager() else {
                continue;
            };
            let Some(client) = self.find_client(|c| c.id() == id).await else {
                continue;
            };

            client.remove_managed_driver(driver).await;
            if client.count().await == 0 {
                self.listener.remove_client(&client).await;
                client.disconnect_server().await;
                self.remove_client(&client).await;
            }
        }

        for driver in drivers {
            let Some(id) = driver.read().await.server_manager() else {
                continue;
            };
            let Some(server) = self.find_server(|s| s.id() == id).await else {
                continue;
            };

            if let Err(e) = server.stop_driver(driver).await {
                tracing::warn!("Failed to stop driver on port {}: {}", server.port(), e);
            }
            if server.size().await == 0 {
                server.stop().await;
                self.remove_server(&server).await;
            }
        }

        self.ports.lock().await.reset();
    }

    /// Client-only session for a driver served elsewhere
    pub async fn connect_remote_host(self: &Arc<Self>, driver: &DriverHandle) -> DriverResult<()> {
        let (host, port) = {
            let dv = driver.read().await;
            (dv.host.clone(), dv.port.unwrap_or(INDI_DEFAULT_PORT))
        };

        let client = Arc::new(ClientManager::new(&host, port, self.config.blob_mode));
        client.append_managed_driver(driver.clone()).await;
        let client_rx = client.subscribe();

        tracing::info!("Connecting to remote INDI server {}:{} ...", host, port);
        if let Err(e) = self.connect_with_retry(&client).await {
            client.remove_managed_driver(driver).await;
            tracing::error!("{}", e);
            return Err(e);
        }

        self.clients.write().await.push(client.clone());
        self.listener.add_client(client.clone()).await;
        self.watch_client(client_rx);
        Ok(())
    }

    pub async fn disconnect_remote_host(&self, driver: &DriverHandle) -> bool {
        let Some(id) = driver.read().await.client_manager() else {
            return false;
        };
        let Some(client) = self.find_client(|c| c.id() == id).await else {
            return false;
        };

        client.remove_managed_driver(driver).await;
        client.disconnect_server().await;
        self.listener.remove_client(&client).await;
        self.remove_client(&client).await;
        true
    }

    pub async fn restart_driver(&self, driver: &DriverHandle) -> DriverResult<()> {
        let (server_id, client_id, label) = {
            let dv = driver.read().await;
            (
                dv.server_manager(),
                dv.client_manager(),
                dv.display_label().to_string(),
            )
        };
        let server = match server_id {
            Some(id) => self.find_server(|s| s.id() == id).await,
            None => None,
        };
        let client = match client_id {
            Some(id) => self.find_client(|c| c.id() == id).await,
            None => None,
        };
        match (server, client) {
            (Some(server), Some(client)) => server.restart_driver(driver, &client).await,
            _ => Err(DriverError::DriverNotFound(label)),
        }
    }

    /// Tear down every session and server
    pub async fn clear_servers(&self) {
        let clients: Vec<_> = self.clients.write().await.drain(..).collect();
        for client in clients {
            self.listener.remove_client(&client).await;
            client.disconnect_server().await;
        }

        let servers: Vec<_> = self.servers.write().await.drain(..).collect();
        for server in servers {
            server.stop().await;
        }
        self.ports.lock().await.reset();
    }

    // =========================================================================
    // TERMINATION HANDLING
    // =========================================================================

    async fn find_server<F>(&self, pred: F) -> Option<Arc<ServerManager>>
    where
        F: Fn(&ServerManager) -> bool,
    {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| pred(s))
            .cloned()
    }

    async fn find_client<F>(&self, pred: F) -> Option<Arc<ClientManager>>
    where
        F: Fn(&ClientManager) -> bool,
    {
        self.clients
            .read()
            .await
            .iter()
            .find(|c| pred(c))
            .cloned()
    }

    async fn remove_server(&self, server: &Arc<ServerManager>) {
        self.servers
            .write()
            .await
            .retain(|s| !Arc::ptr_eq(s, server));
    }

    async fn remove_client(&self, client: &Arc<ClientManager>) {
        self.clients
            .write()
            .await
            .retain(|c| !Arc::ptr_eq(c, client));
    }

    // Watchers hold only a receiver and a weak manager reference; they end when the
    // watched manager is dropped.
    fn watch_server(self: &Arc<Self>, mut rx: broadcast::Receiver<ServerEvent>) {
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(manager) = this.upgrade() else {
                    break;
                };
                match event {
                    ServerEvent::Terminated { host, port, .. } => {
                        manager.process_server_termination(&host, port).await;
                        break;
                    }
                    ServerEvent::DriverCrashed {
                        host,
                        port,
                        exec,
                        label,
                    } => {
                        manager.process_driver_crash(&host, port, &exec, &label).await;
                    }
                    ServerEvent::Started { .. } => {}
                }
            }
        });
    }

    fn watch_client(self: &Arc<Self>, mut rx: broadcast::Receiver<ClientEvent>) {
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                if let ClientEvent::ConnectionFailure { host, port } = event {
                    if let Some(manager) = this.upgrade() {
                        manager.process_client_termination(&host, port).await;
                    }
                    break;
                }
            }
        });
    }

    /// Server process died: reset its drivers and forget it
    pub async fn process_server_termination(&self, host: &str, port: u16) {
        let Some(server) = self
            .find_server(|s| s.host() == host && s.port() == port)
            .await
        else {
            return;
        };

        for driver in server.managed_drivers().await {
            driver.write().await.reset();
        }
        server.terminate().await;
        self.remove_server(&server).await;

        tracing::warn!("INDI server {}:{} terminated", host, port);
        let _ = self.event_tx.send(DriverManagerEvent::ServerTerminated {
            host: host.to_string(),
            port,
        });
    }

    /// Client session failed: reset its drivers and deregister it
    pub async fn process_client_termination(&self, host: &str, port: u16) {
        let Some(client) = self
            .find_client(|c| c.host() == host && c.port() == port)
            .await
        else {
            return;
        };

        for driver in client.managed_drivers().await {
            driver.write().await.reset();
        }
        self.listener.remove_client(&client).await;
        self.remove_client(&client).await;

        let _ = self.event_tx.send(DriverManagerEvent::ConnectionFailure {
            host: host.to_string(),
            port,
        });
        let _ = self.event_tx.send(DriverManagerEvent::ServerTerminated {
            host: host.to_string(),
            port,
        });
    }

    async fn process_driver_crash(&self, host: &str, port: u16, exec: &str, label: &str) {
        let _ = self.event_tx.send(DriverManagerEvent::DriverCrashed {
            host: host.to_string(),
            port,
            driver: label.to_string(),
        });

        if !self.config.restart_crashed_drivers {
            return;
        }

        let Some(server) = self
            .find_server(|s| s.host() == host && s.port() == port)
            .await
        else {
            return;
        };
        for driver in server.managed_drivers().await {
            if driver.read().await.exec != exec {
                continue;
            }
            tracing::info!("Restarting crashed driver {}", label);
            if let Err(e) = self.restart_driver(&driver).await {
                tracing::error!("Failed to restart driver {}: {}", label, e);
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::tests::{fake_indi_server, TELESCOPE_DEFS};
    use crate::driver_info::DriverSource;
    use crate::server_manager::tests::{fake_environment, read_commands};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Decline;

    impl RestartPrompt for Decline {
        fn confirm_restart(&self, _driver_label: &str) -> bool {
            false
        }
    }

    fn local_driver(label: &str, exec: &str) -> DriverHandle {
        let mut dv = DriverInfo::new(label);
        dv.label = label.to_string();
        dv.exec = exec.to_string();
        dv.into_handle()
    }

    fn server_only(config: &DriverManagerConfig, start: u16) -> DriverManagerConfig {
        DriverManagerConfig {
            server_only: true,
            server_port_start: start,
            server_port_end: start + 20,
            ..config.clone()
        }
    }

    #[tokio::test]
    async fn test_unique_hosts_grouping() {
        let manager = DriverManager::new(DriverManagerConfig::default(), Arc::new(IndiListener::new()));
        let mount = local_driver("Mount", "indi_fake_telescope");
        let ccd = local_driver("CCD", "indi_fake_ccd");
        let remote = local_driver("Dome", "indi_fake_dome");
        remote.write().await.set_host_parameters("roof.local", Some(7624));

        let groups = manager
            .get_unique_hosts(&[mount.clone(), remote.clone(), ccd.clone(), mount.clone()])
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert!(Arc::ptr_eq(&groups[0][1], &ccd));
        assert!(Arc::ptr_eq(&groups[1][0], &remote));
    }

    #[tokio::test]
    async fn test_running_driver_restart_declined() {
        let manager = DriverManager::with_prompt(
            DriverManagerConfig::default(),
            Arc::new(IndiListener::new()),
            Arc::new(Decline),
        );
        let mount = local_driver("Mount", "indi_fake_telescope");
        mount.write().await.set_server_state(true);

        let err = manager.get_unique_hosts(&[mount]).await.unwrap_err();
        assert!(matches!(err, DriverError::RestartDeclined(label) if label == "Mount"));
    }

    #[tokio::test]
    async fn test_group_start_and_stop() {
        let (dir, config) = fake_environment(None);
        let manager = DriverManager::new(server_only(&config, 47700), Arc::new(IndiListener::new()));
        let mount = local_driver("Telescope Simulator", "indi_fake_telescope");
        let ccd = local_driver("CCD Simulator", "indi_fake_ccd");

        manager
            .start_devices(&[mount.clone(), ccd.clone()])
            .await
            .unwrap();

        let servers = manager.servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].size().await, 2);
        assert!(mount.read().await.server_state());
        assert_eq!(mount.read().await.unique_label(), "Telescope Simulator");
        assert_eq!(ccd.read().await.port, Some(servers[0].port()));

        let commands = read_commands(dir.path(), 2).await;
        assert_eq!(commands[0], "start indi_fake_telescope -n \"Telescope Simulator\"");
        assert_eq!(commands[1], "start indi_fake_ccd -n \"CCD Simulator\"");

        let fifo = servers[0].fifo_path().to_path_buf();
        manager.stop_devices(&[mount.clone(), ccd.clone()]).await;
        assert!(manager.servers().await.is_empty());
        assert!(!fifo.exists());
        assert!(!mount.read().await.server_state());
    }

    #[tokio::test]
    async fn test_group_atomicity() {
        let (_dir, config) = fake_environment(None);
        let manager = DriverManager::new(server_only(&config, 47730), Arc::new(IndiListener::new()));
        let mount = local_driver("Telescope Simulator", "indi_fake_telescope");
        let bogus = local_driver("Bogus CCD", "indi_bogus_ccd");
        let focuser = local_driver("Focuser", "indi_fake_telescope");

        let err = manager
            .start_devices(&[mount.clone(), bogus.clone(), focuser.clone()])
            .await
            .unwrap_err();

        match err {
            DriverError::GroupStartFailed { drivers, .. } => assert_eq!(drivers.len(), 3),
            other => panic!("unexpected error {other}"),
        }
        assert!(manager.servers().await.is_empty());
        assert!(!mount.read().await.server_state());
        assert!(mount.read().await.server_manager().is_none());
        assert!(!focuser.read().await.server_state());
    }

    #[tokio::test]
    async fn test_connection_failure_deregisters_client() {
        let (_dir, config) = fake_environment(None);
        let config = DriverManagerConfig {
            server_port_start: 47760,
            server_port_end: 47780,
            connect_retry_delay_ms: 10,
            ..(*config).clone()
        };
        let manager = DriverManager::new(config, Arc::new(IndiListener::new()));
        let mount = local_driver("Telescope Simulator", "indi_fake_telescope");

        let err = manager.start_devices(&[mount.clone()]).await.unwrap_err();
        assert!(matches!(err, DriverError::ConnectionFailed { attempts: 2, .. }));
        assert!(manager.clients().await.is_empty());
        assert!(!mount.read().await.client_state());
        // The server is left running for the caller to stop
        assert_eq!(manager.servers().await.len(), 1);
        manager.clear_servers().await;
        assert!(manager.servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_host_connect_and_disconnect() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_secs(5)).await;
        let listener = Arc::new(IndiListener::new());
        let manager = DriverManager::new(DriverManagerConfig::default(), listener.clone());

        let mut remote = DriverInfo::new("Ekos Remote Host");
        remote.source = DriverSource::Generated;
        remote.set_host_parameters("127.0.0.1", Some(port));
        let remote = remote.into_handle();

        let mut rx = listener.subscribe();
        manager.connect_remote_host(&remote).await.unwrap();
        assert!(remote.read().await.client_state());

        timeout(Duration::from_secs(2), async {
            let mut seen = 0;
            while seen < 2 {
                if let Ok(crate::listener::ListenerEvent::NewDevice(_)) = rx.recv().await {
                    seen += 1;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            manager.get_unique_device_label("Telescope Simulator").await,
            "Telescope Simulator 2"
        );
        assert_eq!(manager.get_unique_device_label("CCD Simulator").await, "CCD Simulator");

        assert!(manager.disconnect_remote_host(&remote).await);
        assert!(!manager.disconnect_remote_host(&remote).await);
        assert!(listener.get_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_server_loss_is_reported() {
        let port = fake_indi_server(TELESCOPE_DEFS, Duration::from_millis(200)).await;
        let manager = DriverManager::new(DriverManagerConfig::default(), Arc::new(IndiListener::new()));
        let mut events = manager.subscribe();

        let mut remote = DriverInfo::new("Observatory");
        remote.source = DriverSource::Host;
        remote.set_host_parameters("127.0.0.1", Some(port));
        let remote = remote.into_handle();
        manager.connect_remote_host(&remote).await.unwrap();

        let event = timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(DriverManagerEvent::ServerTerminated { port, .. }) = events.recv().await {
                    return port;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, port);
        assert!(manager.clients().await.is_empty());
        assert!(remote.read().await.client_manager().is_none());
    }

    #[tokio::test]
    async fn test_catalog_roster() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("drivers.xml"),
            r#"<driversList><devGroup group="CCDs">
                <device label="CCD Simulator"><driver name="CCD Simulator">indi_simulator_ccd</driver><version>1.0</version></device>
            </devGroup></driversList>"#,
        )
        .unwrap();
        let config = DriverManagerConfig {
            drivers_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let manager = DriverManager::new(config, Arc::new(IndiListener::new()));
        assert_eq!(manager.load_catalog().await.unwrap(), 1);
        assert_eq!(manager.load_catalog().await.unwrap(), 0);

        assert!(manager.find_driver_by_exec("indi_simulator_ccd").await.is_some());
        assert!(manager.find_driver_by_name("CCD Simulator").await.is_some());
        let list = manager.driver_list().await;
        assert_eq!(list[0]["binary"], "indi_simulator_ccd");
        assert_eq!(list[0]["family"], "CCDs");
    }
}
