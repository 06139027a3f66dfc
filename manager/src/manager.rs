//! Ekos device lifecycle
//!
//! `EkosManager` turns an equipment profile into a set of managed drivers, starts them
//! (local servers or a remote session), counts the devices they announce and declares
//! the setup ready once every expected device appeared. A timeout reports the devices
//! that never showed up.
//!
//! The manager follows the shared [`IndiListener`] and [`DriverManager`] event streams
//! from the moment it is created; events are ignored while no start attempt is active.

use crate::config::ManagerConfig;
use crate::device_ops::ListenerDeviceLookup;
use crate::error::{ManagerError, ManagerResult};
use crate::profile::{ProfileInfo, Role};
use crate::readiness::{self, CountdownStep, DeviceCountdown};
use ekos_drivers::{
    DeviceFamily, DeviceInfo, DriverError, DriverHandle, DriverInfo, DriverManager,
    DriverManagerEvent, DriverSource, GenericDevice, IndiListener, ListenerEvent,
};
use ekos_indi::{standard_properties, PropertyState};
use ekos_sequencer::SharedDeviceLookup;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Newest entries first; older ones are dropped past this size
const MAX_LOG_ENTRIES: usize = 1000;

const CONFIG_PROCESS: &str = "CONFIG_PROCESS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommunicationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Progress of starting the profile's drivers
    EkosStatusChanged(CommunicationStatus),
    /// Progress of connecting the discovered devices
    IndiStatusChanged(CommunicationStatus),
    NewLog(String),
}

#[derive(Default)]
struct ManagerState {
    profile: Option<ProfileInfo>,
    local_mode: bool,
    managed_drivers: Vec<DriverHandle>,
    countdown: DeviceCountdown,
    ekos_status: CommunicationStatus,
    indi_status: CommunicationStatus,
    primary_camera: Option<String>,
    guide_camera: Option<String>,
    cleaning: bool,
}

impl ManagerState {
    fn is_active(&self) -> bool {
        self.ekos_status != CommunicationStatus::Idle && !self.cleaning
    }

    fn auto_connect(&self) -> bool {
        self.profile.as_ref().map_or(false, |p| p.auto_connect)
    }
}

pub struct EkosManager {
    config: ManagerConfig,
    drivers: Arc<DriverManager>,
    state: RwLock<ManagerState>,
    log: Mutex<Vec<String>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl EkosManager {
    /// Must be called inside a tokio runtime; the event watchers are spawned here.
    pub fn new(config: ManagerConfig, drivers: Arc<DriverManager>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let listener_rx = drivers.listener().subscribe();
        let drivers_rx = drivers.subscribe();

        let manager = Arc::new(Self {
            config,
            drivers,
            state: RwLock::new(ManagerState::default()),
            log: Mutex::new(Vec::new()),
            event_tx,
            watchers: Mutex::new(Vec::new()),
            timeout_task: Mutex::new(None),
        });

        let watchers = vec![
            manager.watch_listener(listener_rx),
            manager.watch_driver_manager(drivers_rx),
        ];
        *manager
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = watchers;
        manager
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn driver_manager(&self) -> &Arc<DriverManager> {
        &self.drivers
    }

    pub fn listener(&self) -> &Arc<IndiListener> {
        self.drivers.listener()
    }

    /// Device lookup for task actions, backed by the live device list
    pub fn device_lookup(&self) -> SharedDeviceLookup {
        Arc::new(ListenerDeviceLookup::new(self.listener().clone()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn ekos_status(&self) -> CommunicationStatus {
        self.state.read().await.ekos_status
    }

    pub async fn indi_status(&self) -> CommunicationStatus {
        self.state.read().await.indi_status
    }

    /// Devices still expected before the setup counts as ready
    pub async fn remaining_devices(&self) -> i64 {
        self.state.read().await.countdown.remaining()
    }

    pub async fn managed_drivers(&self) -> Vec<DriverHandle> {
        self.state.read().await.managed_drivers.clone()
    }

    pub async fn is_local_mode(&self) -> bool {
        self.state.read().await.local_mode
    }

    pub async fn profile(&self) -> Option<ProfileInfo> {
        self.state.read().await.profile.clone()
    }

    pub async fn primary_camera(&self) -> Option<String> {
        self.state.read().await.primary_camera.clone()
    }

    pub async fn guide_camera(&self) -> Option<String> {
        self.state.read().await.guide_camera.clone()
    }

    // =========================================================================
    // LOG BUFFER
    // =========================================================================

    pub fn append_log(&self, text: &str) {
        let entry = format!(
            "{} {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
            text
        );
        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.insert(0, entry);
            log.truncate(MAX_LOG_ENTRIES);
        }
        tracing::info!("{}", text);
        let _ = self.event_tx.send(ManagerEvent::NewLog(text.to_string()));
    }

    /// Log entries, newest first
    pub fn log_entries(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log_text(&self) -> String {
        self.log_entries().join("\n")
    }

    pub fn clear_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    fn update_ekos_status(&self, state: &mut ManagerState, status: CommunicationStatus) {
        if state.ekos_status != status {
            state.ekos_status = status;
            let _ = self.event_tx.send(ManagerEvent::EkosStatusChanged(status));
        }
    }

    fn update_indi_status(&self, state: &mut ManagerState, status: CommunicationStatus) {
        if state.indi_status != status {
            state.indi_status = status;
            let _ = self.event_tx.send(ManagerEvent::IndiStatusChanged(status));
        }
    }

    // =========================================================================
    // START / STOP
    // =========================================================================

    /// Start every driver of `profile`. Ignored with [`ManagerError::StartInProgress`]
    /// while a previous start is pending or succeeded.
    pub async fn start(self: &Arc<Self>, profile: ProfileInfo) -> ManagerResult<()> {
        let previous = self.state.read().await.ekos_status;
        match previous {
            CommunicationStatus::Pending | CommunicationStatus::Success => {
                tracing::warn!(
                    "Ekos Manager start called but current Ekos Status is {:?}. Ignoring request.",
                    previous
                );
                return Err(ManagerError::StartInProgress);
            }
            // Leftovers of a failed attempt may still be running
            CommunicationStatus::Error => self.clean_devices(true).await,
            CommunicationStatus::Idle => {}
        }

        self.reset().await;

        let local = profile.is_local();
        let planned = if local {
            self.local_drivers(&profile).await
        } else {
            Self::remote_drivers(&profile)
        };
        let (managed, expected) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                self.append_log(&e.to_string());
                let mut state = self.state.write().await;
                state.profile = Some(profile);
                state.local_mode = local;
                self.update_ekos_status(&mut state, CommunicationStatus::Error);
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            state.profile = Some(profile.clone());
            state.local_mode = local;
            state.managed_drivers = managed.clone();
            state.countdown = DeviceCountdown::new(expected);
            self.update_ekos_status(&mut state, CommunicationStatus::Pending);
        }

        let result = if local {
            self.append_log("Starting INDI services...");
            self.drivers.start_devices(&managed).await
        } else {
            self.append_log(&format!(
                "Connecting to remote INDI server at {} on port {} ...",
                profile.host.as_deref().unwrap_or_default(),
                profile.port
            ));
            match managed.first() {
                Some(remote) => self.drivers.connect_remote_host(remote).await,
                None => Ok(()),
            }
        };

        if let Err(e) = result {
            return Err(self.start_failed(e).await);
        }

        // Stopped while the drivers were starting
        if !self.state.read().await.is_active() {
            return Ok(());
        }

        self.client_started(&profile, &managed).await;
        self.arm_timeout(local);
        Ok(())
    }

    /// Drivers for a locally served profile, plus the number of devices to expect
    async fn local_drivers(
        &self,
        profile: &ProfileInfo,
    ) -> ManagerResult<(Vec<DriverHandle>, usize)> {
        let mut managed: Vec<DriverInfo> = Vec::new();

        if let Some(mount) = self.catalog_driver(profile, Role::Mount).await {
            managed.push(mount.clone_fresh());
        }

        let ccd = self.catalog_driver(profile, Role::Ccd).await;
        if let Some(ccd) = &ccd {
            managed.push(ccd.clone_fresh());
        }

        let guider = self.catalog_driver(profile, Role::Guider).await;
        if let Some(guider) = &guider {
            if ccd.is_some() && profile.driver(Role::Guider) == profile.driver(Role::Ccd) {
                // A multi-device driver serves both cameras from one process
                if !shares_binary(ccd.as_ref(), guider) {
                    let mut dv = guider.clone_fresh();
                    let label = format!("{} Guide", dv.label);
                    dv.set_unique_label(&label);
                    managed.push(dv);
                }
            } else {
                managed.push(guider.clone_fresh());
            }
        }

        for role in [
            Role::AdaptiveOptics,
            Role::Filter,
            Role::Focuser,
            Role::Dome,
            Role::Weather,
        ] {
            if let Some(dv) = self.catalog_driver(profile, role).await {
                managed.push(dv.clone_fresh());
            }
        }

        for role in Role::AUX {
            let Some(aux) = self.catalog_driver(profile, role).await else {
                continue;
            };
            if shares_binary(ccd.as_ref(), &aux) || shares_binary(guider.as_ref(), &aux) {
                tracing::debug!("Skipping {}: served by the camera driver", aux.label);
                continue;
            }
            managed.push(aux.clone_fresh());
        }

        for remote in profile.remote_driver_list() {
            let mut dv = DriverInfo::new(&remote.name);
            let label = remote.label();
            dv.label = label.clone();
            dv.set_unique_label(&label);
            dv.remote_host = Some(remote.host);
            dv.remote_port = Some(remote.port);
            managed.push(dv);
        }

        if ccd.is_none() && guider.is_none() && profile.remote_drivers.trim().is_empty() {
            return Err(ManagerError::NoCameraOrGuider);
        }
        if managed.is_empty() {
            return Err(ManagerError::NoProfileDrivers(profile.name.clone()));
        }

        let expected = managed.len();
        Ok((
            managed.into_iter().map(DriverInfo::into_handle).collect(),
            expected,
        ))
    }

    /// One generated driver standing for the whole remote server
    fn remote_drivers(profile: &ProfileInfo) -> ManagerResult<(Vec<DriverHandle>, usize)> {
        if !profile.has_role(Role::Ccd)
            && !profile.has_role(Role::Guider)
            && profile.remote_drivers.trim().is_empty()
        {
            return Err(ManagerError::NoCameraOrGuider);
        }

        let mut remote = DriverInfo::new("Ekos Remote Host");
        remote.label = "Ekos Remote Host".to_string();
        remote.set_host_parameters(profile.host.as_deref().unwrap_or_default(), Some(profile.port));
        remote.source = DriverSource::Generated;

        Ok((vec![remote.into_handle()], profile.driver_labels().len()))
    }

    async fn catalog_driver(&self, profile: &ProfileInfo, role: Role) -> Option<DriverInfo> {
        let label = profile.driver(role)?;
        match self.drivers.find_driver_by_label(label).await {
            Some(driver) => Some(driver.read().await.clone()),
            None => {
                tracing::warn!("{} driver {} is not in the driver catalog", role.key(), label);
                None
            }
        }
    }

    async fn start_failed(&self, error: DriverError) -> ManagerError {
        let mut state = self.state.write().await;
        let mode = if state.local_mode { "local" } else { "remote" };
        match &error {
            // The servers are up; keep the drivers so stop() can tear them down
            DriverError::ConnectionFailed { host, port, .. } => {
                self.append_log(&format!(
                    "Failed to connect to {} INDI server {}:{}",
                    mode, host, port
                ));
            }
            other => {
                self.append_log(&other.to_string());
                state.managed_drivers.clear();
            }
        }
        self.update_ekos_status(&mut state, CommunicationStatus::Error);
        ManagerError::Driver(error)
    }

    async fn client_started(&self, profile: &ProfileInfo, managed: &[DriverHandle]) {
        let Some(first) = managed.first() else {
            return;
        };
        let (host, port) = {
            let dv = first.read().await;
            (dv.host.clone(), dv.port.unwrap_or(profile.port))
        };

        if profile.is_local() {
            if profile.auto_connect {
                self.append_log(&format!("INDI services started on port {}.", port));
            } else {
                self.append_log(&format!(
                    "INDI services started on port {}. Please connect devices.",
                    port
                ));
            }
        } else {
            self.append_log(&format!(
                "INDI services started. Connection to remote INDI server {}:{} is successful. Waiting for devices...",
                host, port
            ));
        }
    }

    fn arm_timeout(self: &Arc<Self>, local: bool) {
        let this = Arc::downgrade(self);
        let delay = self.config.device_timeout(local);
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.check_indi_timeout().await;
            }
        });
        let previous = self
            .timeout_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop every managed driver and return to Idle
    pub async fn stop(&self) {
        self.clean_devices(true).await;
    }

    /// Forget the current attempt. With `stop_drivers` the local servers are stopped or
    /// the remote session is closed; otherwise they are assumed gone already.
    pub async fn clean_devices(&self, stop_drivers: bool) {
        let (managed, local) = {
            let mut state = self.state.write().await;
            if state.ekos_status == CommunicationStatus::Idle || state.cleaning {
                return;
            }
            state.cleaning = true;
            (state.managed_drivers.clone(), state.local_mode)
        };

        if stop_drivers && !managed.is_empty() {
            if local {
                self.drivers.stop_devices(&managed).await;
            } else if let Some(remote) = managed.first() {
                self.drivers.disconnect_remote_host(remote).await;
            }
        }

        self.reset().await;
        self.append_log("INDI services stopped.");
    }

    pub async fn reset(&self) {
        tracing::debug!("Resetting Ekos Manager...");
        let timeout_task = self
            .timeout_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = timeout_task {
            task.abort();
        }

        let mut state = self.state.write().await;
        state.managed_drivers.clear();
        state.countdown = DeviceCountdown::default();
        state.primary_camera = None;
        state.guide_camera = None;
        state.cleaning = false;
        self.update_ekos_status(&mut state, CommunicationStatus::Idle);
        self.update_indi_status(&mut state, CommunicationStatus::Idle);
    }

    /// Restart the local driver that produced `device_name`
    pub async fn restart_driver(&self, device_name: &str) -> ManagerResult<()> {
        tracing::info!("Restarting driver {}", device_name);
        let device = self
            .listener()
            .find_device(device_name)
            .await
            .ok_or_else(|| ManagerError::DeviceNotFound(device_name.to_string()))?;

        let managed = self.managed_drivers().await;
        for driver in managed {
            if driver.read().await.id() == device.driver_id() {
                return Ok(self.drivers.restart_driver(&driver).await?);
            }
        }
        Err(ManagerError::DeviceNotFound(device_name.to_string()))
    }

    // =========================================================================
    // DEVICE DISCOVERY
    // =========================================================================

    /// Count a newly announced device; the setup is ready once all expected devices
    /// appeared.
    pub async fn process_new_device(&self, device: &Arc<GenericDevice>) -> CountdownStep {
        tracing::info!("Ekos received a new device: {}", device.name());

        let mut names: Vec<String> = self
            .listener()
            .get_devices()
            .await
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        if !names.iter().any(|n| n == device.name()) {
            names.push(device.name().to_string());
        }

        let mut state = self.state.write().await;
        let step = state.countdown.record(device.name());
        if step == CountdownStep::Duplicate {
            tracing::debug!("Device {} already counted", device.name());
            return step;
        }

        for driver in &state.managed_drivers {
            let mut dv = driver.write().await;
            if dv.id() == device.driver_id() {
                dv.add_device(DeviceInfo::new(device));
                break;
            }
        }

        self.update_indi_status(&mut state, CommunicationStatus::Idle);

        let cameras = state.profile.as_ref().and_then(|p| {
            let ccd = p.driver(Role::Ccd)?.to_lowercase();
            let guider = p.driver(Role::Guider)?.to_lowercase();
            (ccd != guider).then_some((ccd, guider))
        });
        if let Some((ccd, guider)) = cameras {
            for name in &names {
                let lowered = name.to_lowercase();
                if lowered.starts_with(&ccd) {
                    state.primary_camera = Some(name.clone());
                } else if lowered.starts_with(&guider) {
                    state.guide_camera = Some(name.clone());
                }
            }
        }

        if state.countdown.is_ready() {
            self.update_ekos_status(&mut state, CommunicationStatus::Success);
            if !state.local_mode && state.countdown.remaining() == 0 {
                if state.auto_connect() {
                    self.append_log("Remote devices established.");
                } else {
                    self.append_log("Remote devices established. Please connect devices.");
                }
            }
        }
        step
    }

    /// Runs when the device timeout fires. Returns the report logged, if any.
    pub async fn check_indi_timeout(&self) -> Option<String> {
        let (ekos_status, indi_status, auto_connect, local, ready, managed, profile_drivers) = {
            let state = self.state.read().await;
            (
                state.ekos_status,
                state.indi_status,
                state.auto_connect(),
                state.local_mode,
                state.countdown.is_ready(),
                state.managed_drivers.clone(),
                state
                    .profile
                    .as_ref()
                    .map(ProfileInfo::driver_labels)
                    .unwrap_or_default(),
            )
        };

        if ekos_status != CommunicationStatus::Pending {
            // Every device appeared; complain only about those that never connected
            if indi_status != CommunicationStatus::Pending || !auto_connect {
                return None;
            }
            let mut disconnected = Vec::new();
            for device in self.listener().get_devices().await {
                if !device.is_connected().await {
                    disconnected.push(device.name().to_string());
                }
            }
            if disconnected.is_empty() {
                return None;
            }
            let message = readiness::connection_report(&disconnected);
            self.append_log(&message);
            return Some(message);
        }

        if ready {
            let mut state = self.state.write().await;
            self.update_ekos_status(&mut state, CommunicationStatus::Success);
            return None;
        }

        let missing = if local {
            let mut entries = Vec::with_capacity(managed.len());
            for driver in &managed {
                let dv = driver.read().await;
                let label = if dv.unique_label().is_empty() {
                    dv.name.clone()
                } else {
                    dv.unique_label().to_string()
                };
                entries.push((label, dv.devices().len()));
            }
            readiness::missing_local(entries.iter().map(|(label, n)| (label.as_str(), *n)))
        } else {
            let mut driver_names = Vec::new();
            for device in self.listener().get_devices().await {
                if let Some(name) = device.driver_name().await {
                    driver_names.push(name);
                }
            }
            readiness::missing_remote(&profile_drivers, &driver_names)
        };

        let message = readiness::timeout_report(&missing, !local);
        tracing::warn!("Device timeout: {} device(s) missing", missing.len());
        self.append_log(&message);

        let mut state = self.state.write().await;
        if state.ekos_status == CommunicationStatus::Pending {
            self.update_ekos_status(&mut state, CommunicationStatus::Error);
        }
        Some(message)
    }

    pub async fn remove_device(&self, name: &str) {
        {
            let state = self.state.read().await;
            for driver in &state.managed_drivers {
                driver.write().await.remove_device(name);
            }
        }
        self.append_log(&format!("{} is offline.", name));

        if self.listener().get_devices().await.is_empty() {
            let mut state = self.state.write().await;
            self.update_indi_status(&mut state, CommunicationStatus::Idle);
        }
    }

    // =========================================================================
    // DEVICE CONNECTION
    // =========================================================================

    /// Marks the connection status Success once every known device is connected
    pub async fn is_indi_ready(&self) -> bool {
        let devices = self.listener().get_devices().await;
        let mut connected = 0;
        for device in &devices {
            if device.is_connected().await {
                connected += 1;
            }
        }

        let ready = connected == devices.len();
        let mut state = self.state.write().await;
        let status = if ready {
            CommunicationStatus::Success
        } else {
            CommunicationStatus::Pending
        };
        self.update_indi_status(&mut state, status);
        ready
    }

    pub async fn connect_devices(&self) {
        if self.is_indi_ready().await {
            return;
        }
        for device in self.listener().get_devices().await {
            tracing::debug!("Connecting {}", device.name());
            if let Err(e) = device.connect().await {
                tracing::warn!("Failed to connect {}: {}", device.name(), e);
            }
        }
        self.append_log("Connecting INDI devices...");
    }

    pub async fn disconnect_devices(&self) {
        for device in self.listener().get_devices().await {
            tracing::debug!("Disconnecting {}", device.name());
            if let Err(e) = device.disconnect().await {
                tracing::warn!("Failed to disconnect {}: {}", device.name(), e);
            }
        }
        self.append_log("Disconnecting INDI devices...");
    }

    /// A device reported `CONNECTION` on: load its saved configuration if asked to
    pub async fn device_connected(&self, name: &str) {
        let Some(device) = self.listener().find_device(name).await else {
            return;
        };
        tracing::info!("{} is connected.", name);

        if let Some(element) = self.config.config_on_connect.element() {
            let idle = device
                .property(CONFIG_PROCESS)
                .await
                .is_some_and(|p| p.state == PropertyState::Idle);
            if idle {
                if let Err(e) = device
                    .client()
                    .set_switch(name, CONFIG_PROCESS, element, true)
                    .await
                {
                    tracing::warn!("Failed to load configuration of {}: {}", name, e);
                }
            }
        }

        self.is_indi_ready().await;
    }

    /// A device reported `CONNECTION` off; `state` is the vector state it came with
    pub async fn device_disconnected(&self, name: &str, state: PropertyState) {
        let status = match state {
            PropertyState::Alert => CommunicationStatus::Error,
            PropertyState::Busy => CommunicationStatus::Pending,
            _ => CommunicationStatus::Idle,
        };

        match status {
            CommunicationStatus::Error => self.append_log(&format!(
                "{} failed to connect.\nPlease ensure the device is connected and powered on.",
                name
            )),
            CommunicationStatus::Idle => self.append_log(&format!("{} is disconnected.", name)),
            _ => tracing::debug!("{} is disconnecting", name),
        }

        let mut manager_state = self.state.write().await;
        self.update_indi_status(&mut manager_state, status);
    }

    async fn auto_connect(&self, name: &str) {
        let Some(device) = self.listener().find_device(name).await else {
            return;
        };
        if device.is_connected().await {
            return;
        }
        tracing::info!("Connecting to {}", name);
        if let Err(e) = device.connect().await {
            tracing::warn!("Failed to connect {}: {}", name, e);
        }
    }

    // =========================================================================
    // SERVER EVENTS
    // =========================================================================

    async fn owns_endpoint(&self, host: &str, port: u16) -> bool {
        let managed = self.state.read().await.managed_drivers.clone();
        for driver in managed {
            let dv = driver.read().await;
            if dv.host == host && dv.port == Some(port) {
                return true;
            }
        }
        false
    }

    /// The server behind the current profile went away
    pub async fn process_server_termination(&self, host: &str, port: u16) {
        if !self.state.read().await.is_active() || !self.owns_endpoint(host, port).await {
            return;
        }

        tracing::warn!("INDI server {}:{} terminated", host, port);
        self.clean_devices(false).await;

        let mut state = self.state.write().await;
        self.update_ekos_status(&mut state, CommunicationStatus::Error);
    }

    async fn process_connection_failure(&self, host: &str, port: u16) {
        if !self.state.read().await.is_active() || !self.owns_endpoint(host, port).await {
            return;
        }

        let mut state = self.state.write().await;
        let mode = if state.local_mode { "local" } else { "remote" };
        self.append_log(&format!(
            "Lost connection to {} INDI server {}:{}",
            mode, host, port
        ));
        self.update_ekos_status(&mut state, CommunicationStatus::Error);
    }

    // =========================================================================
    // WATCHERS
    // =========================================================================

    fn watch_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<ListenerEvent>,
    ) -> JoinHandle<()> {
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Ekos manager lagged by {} device events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.handle_listener_event(event).await;
            }
        })
    }

    async fn handle_listener_event(&self, event: ListenerEvent) {
        let (active, auto_connect) = {
            let state = self.state.read().await;
            (state.is_active(), state.auto_connect())
        };
        if !active {
            return;
        }

        match event {
            ListenerEvent::NewDevice(device) => {
                self.process_new_device(&device).await;
            }
            ListenerEvent::DeviceClassified { device, family } => {
                if family != DeviceFamily::Auxiliary {
                    self.append_log(&format!("{} is online.", device));
                }
            }
            ListenerEvent::PropertyDefined {
                device, property, ..
            } if property == standard_properties::CONNECTION => {
                if auto_connect {
                    self.auto_connect(&device).await;
                }
            }
            ListenerEvent::PropertyUpdated {
                device,
                property,
                state,
            } if property == standard_properties::CONNECTION => {
                let connected = match self.listener().find_device(&device).await {
                    Some(handle) => handle.is_connected().await,
                    None => false,
                };
                if connected {
                    self.device_connected(&device).await;
                } else {
                    self.device_disconnected(&device, state).await;
                }
            }
            ListenerEvent::DeviceRemoved(name) => {
                self.remove_device(&name).await;
            }
            _ => {}
        }
    }

    fn watch_driver_manager(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<DriverManagerEvent>,
    ) -> JoinHandle<()> {
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
                    DriverManagerEvent::ServerTerminated { host, port } => {
                        manager.process_server_termination(&host, port).await;
                    }
                    DriverManagerEvent::ConnectionFailure { host, port } => {
                        manager.process_connection_failure(&host, port).await;
                    }
                    DriverManagerEvent::DriverCrashed { host, port, driver } => {
                        if manager.owns_endpoint(&host, port).await {
                            manager.append_log(&format!(
                                "INDI driver {} crashed on {}:{}.",
                                driver, host, port
                            ));
                        }
                    }
                }
            }
        })
    }
}

impl Drop for EkosManager {
    fn drop(&mut self) {
        let watchers = self
            .watchers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in watchers.drain(..) {
            task.abort();
        }
        let timeout_task = self
            .timeout_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = timeout_task.take() {
            task.abort();
        }
    }
}

/// Same executable as a multi-device `primary`, so one process serves both
fn shares_binary(primary: Option<&DriverInfo>, secondary: &DriverInfo) -> bool {
    primary.is_some_and(|p| p.exec == secondary.exec && p.is_mdpd())
}
