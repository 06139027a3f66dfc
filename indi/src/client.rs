//! INDI client implementation
//!
//! One `IndiClient` owns one TCP session to an INDI server. The socket is split into a
//! writer task fed by an mpsc channel and a reader task that parses the XML stream,
//! keeps the property cache current and broadcasts [`IndiEvent`]s.

use crate::error::{IndiError, IndiResult};
use crate::property::{Element, ElementValue, Permission, Property, PropertyKind, PropertyState, SwitchRule};
use crate::protocol::{self, standard_properties, BlobMode, INDI_PROTOCOL_VERSION};
use crate::{IndiDevice, IndiTimeoutConfig, INDI_DEFAULT_PORT};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;

/// INDI client event
#[derive(Debug, Clone)]
pub enum IndiEvent {
    /// Device announced for the first time
    DeviceDefined(String),
    /// Device deleted by the server (`delProperty` without a name)
    DeviceRemoved(String),
    /// Property defined
    PropertyDefined {
        device: String,
        property: String,
        kind: PropertyKind,
    },
    /// Property updated
    PropertyUpdated {
        device: String,
        property: String,
        state: PropertyState,
    },
    /// Property deleted
    PropertyDeleted { device: String, property: String },
    /// Free-form message from the server or a device
    Message {
        device: Option<String>,
        message: String,
    },
    /// BLOB received with format information
    BlobReceived {
        device: String,
        property: String,
        element: String,
        data: Vec<u8>,
        format: String,
        size: usize,
    },
    /// Connection state changed
    ConnectionStateChanged(bool),
    /// Session ended; negative exit codes mean the server went away on its own
    ServerDisconnected { exit_code: i32 },
    /// Error occurred
    Error(String),
}

type PropertyMap = HashMap<(String, String), Property>;

/// INDI client for communicating with an INDI server
pub struct IndiClient {
    host: String,
    port: u16,
    connected: Arc<AtomicBool>,
    devices: Arc<RwLock<HashMap<String, IndiDevice>>>,
    properties: Arc<RwLock<PropertyMap>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    event_tx: broadcast::Sender<IndiEvent>,
    timeout_config: IndiTimeoutConfig,
}

impl IndiClient {
    /// Create a new INDI client
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self::with_timeout_config(host, port, IndiTimeoutConfig::default())
    }

    /// Create a new INDI client with custom timeout configuration
    pub fn with_timeout_config(
        host: &str,
        port: Option<u16>,
        timeout_config: IndiTimeoutConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(timeout_config.event_capacity);
        Self {
            host: host.to_string(),
            port: port.unwrap_or(INDI_DEFAULT_PORT),
            connected: Arc::new(AtomicBool::new(false)),
            devices: Arc::new(RwLock::new(HashMap::new())),
            properties: Arc::new(RwLock::new(HashMap::new())),
            tx: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            event_tx,
            timeout_config,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Subscribe to INDI events
    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to the INDI server and request all properties
    pub async fn connect(&self) -> IndiResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        let connection_timeout = self.timeout_config.connection_timeout();

        let stream = match timeout(connection_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    duration: connection_timeout,
                });
            }
        };

        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel::<String>(self.timeout_config.command_queue_depth);
        *self.tx.write().await = Some(tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        tokio::spawn(Self::writer_task(write_half, rx));

        let session = WireSession {
            devices: self.devices.clone(),
            properties: self.properties.clone(),
            event_tx: self.event_tx.clone(),
            vector: None,
            element: None,
        };
        let connected = self.connected.clone();
        let event_tx = self.event_tx.clone();
        let endpoint = addr.clone();
        tokio::spawn(async move {
            Self::supervised_reader_task(read_half, session, connected, event_tx, endpoint, shutdown_rx)
                .await;
        });

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(true));
        tracing::info!("Connected to INDI server {}", addr);

        self.send_command(&protocol::get_properties(INDI_PROTOCOL_VERSION, None))
            .await
    }

    /// Writer task - sends commands to INDI server
    async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = writer.write_all(cmd.as_bytes()).await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                tracing::error!("INDI flush error: {}", e);
                break;
            }
        }
    }

    /// Runs the reader until EOF, a fatal parse error or a shutdown request
    async fn supervised_reader_task<R: AsyncRead + Unpin>(
        reader: R,
        session: WireSession,
        connected: Arc<AtomicBool>,
        event_tx: broadcast::Sender<IndiEvent>,
        endpoint: String,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let exit_code = tokio::select! {
            result = session.run(reader) => {
                match result {
                    Ok(()) => {
                        tracing::info!("INDI server {} closed the connection", endpoint);
                    }
                    Err(e) => {
                        tracing::error!("INDI reader for {} stopped: {}", endpoint, e);
                        let _ = event_tx.send(IndiEvent::Error(e.to_string()));
                    }
                }
                -1
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("INDI reader for {} received shutdown signal", endpoint);
                0
            }
        };

        // A user disconnect has already flipped the flag and emitted its own events.
        if connected.swap(false, Ordering::SeqCst) {
            let _ = event_tx.send(IndiEvent::ConnectionStateChanged(false));
            let _ = event_tx.send(IndiEvent::ServerDisconnected { exit_code });
        }
    }

    /// Disconnect from the INDI server and clear cached state
    pub async fn disconnect(&self) -> IndiResult<()> {
        tracing::info!("Disconnecting from INDI server {}:{}", self.host, self.port);

        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        *self.tx.write().await = None;

        self.devices.write().await.clear();
        self.properties.write().await.clear();

        if was_connected {
            let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(false));
            let _ = self.event_tx.send(IndiEvent::ServerDisconnected { exit_code: 0 });
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a raw INDI command
    pub async fn send_command(&self, command: &str) -> IndiResult<()> {
        let tx = self.tx.read().await;
        match tx.as_ref() {
            Some(tx) => tx.send(command.to_string()).await.map_err(|e| {
                IndiError::ChannelClosed(format!(
                    "Failed to send INDI command to {}:{}: {}",
                    self.host, self.port, e
                ))
            }),
            None => Err(IndiError::NotConnected),
        }
    }

    /// Get the list of discovered devices
    pub async fn get_devices(&self) -> Vec<IndiDevice> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn get_device(&self, name: &str) -> Option<IndiDevice> {
        self.devices.read().await.get(name).cloned()
    }

    /// Get properties for a device
    pub async fn get_properties(&self, device_name: &str) -> Vec<Property> {
        self.properties
            .read()
            .await
            .iter()
            .filter(|((device, _), _)| device == device_name)
            .map(|(_, prop)| prop.clone())
            .collect()
    }

    /// Get a property
    pub async fn get_property(&self, device: &str, property: &str) -> Option<Property> {
        self.properties
            .read()
            .await
            .get(&(device.to_string(), property.to_string()))
            .cloned()
    }

    /// Get a number element value
    pub async fn get_number(&self, device: &str, property: &str, element: &str) -> Option<f64> {
        self.get_property(device, property)
            .await
            .and_then(|p| p.number(element))
    }

    /// Get a switch element value
    pub async fn get_switch(&self, device: &str, property: &str, element: &str) -> Option<bool> {
        self.get_property(device, property)
            .await
            .and_then(|p| p.switch(element))
    }

    /// Get a text element value
    pub async fn get_text(&self, device: &str, property: &str, element: &str) -> Option<String> {
        self.get_property(device, property)
            .await
            .and_then(|p| p.text(element).map(str::to_string))
    }

    /// Enable BLOB delivery for a device
    pub async fn enable_blob(&self, device: &str, mode: BlobMode) -> IndiResult<()> {
        self.send_command(&protocol::enable_blob(device, None, mode))
            .await
    }

    /// Send the full element set of a locally modified property
    pub async fn send_new_property(&self, property: &Property) -> IndiResult<()> {
        if property.perm == Permission::ReadOnly {
            return Err(IndiError::PermissionDenied(format!(
                "Property '{}' is read-only",
                property.name
            )));
        }

        let cmd = match property.kind {
            PropertyKind::Switch => {
                let elements: Vec<(String, bool)> = property
                    .elements
                    .iter()
                    .filter_map(|e| match e.value {
                        ElementValue::Switch(on) => Some((e.name.clone(), on)),
                        _ => None,
                    })
                    .collect();
                protocol::new_switch_vector(&property.device, &property.name, &elements)
            }
            PropertyKind::Number => {
                let mut elements = Vec::with_capacity(property.elements.len());
                for e in &property.elements {
                    if let ElementValue::Number { value, min, max, .. } = e.value {
                        if min < max && (value < min || value > max) {
                            return Err(IndiError::ValueOutOfRange {
                                device: property.device.clone(),
                                property: property.name.clone(),
                                element: e.name.clone(),
                                value,
                                min,
                                max,
                            });
                        }
                        elements.push((e.name.clone(), value));
                    }
                }
                protocol::new_number_vector(&property.device, &property.name, &elements)
            }
            PropertyKind::Text => {
                let elements: Vec<(String, String)> = property
                    .elements
                    .iter()
                    .filter_map(|e| match &e.value {
                        ElementValue::Text(v) => Some((e.name.clone(), v.clone())),
                        _ => None,
                    })
                    .collect();
                protocol::new_text_vector(&property.device, &property.name, &elements)
            }
            PropertyKind::Light | PropertyKind::Blob => {
                return Err(IndiError::UnsupportedProperty {
                    property: property.name.clone(),
                    kind: property.kind.as_str().to_string(),
                });
            }
        };

        self.send_command(&cmd).await
    }

    async fn cached_property(&self, device: &str, property: &str) -> IndiResult<Property> {
        self.get_property(device, property)
            .await
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })
    }

    fn element_not_found(property: &Property, element: &str) -> IndiError {
        IndiError::ElementNotFound {
            device: property.device.clone(),
            property: property.name.clone(),
            element: element.to_string(),
        }
    }

    /// Set one switch element, honouring the vector's rule
    pub async fn set_switch(
        &self,
        device: &str,
        property: &str,
        element: &str,
        state: bool,
    ) -> IndiResult<()> {
        let mut prop = self.cached_property(device, property).await?;
        if prop.element(element).is_none() {
            return Err(Self::element_not_found(&prop, element));
        }
        if state && prop.rule != Some(SwitchRule::AnyOfMany) {
            prop.reset_switches();
        }
        if let Some(e) = prop.element_mut(element) {
            e.value = ElementValue::Switch(state);
        }
        self.send_new_property(&prop).await
    }

    /// Set one number element
    pub async fn set_number(
        &self,
        device: &str,
        property: &str,
        element: &str,
        value: f64,
    ) -> IndiResult<()> {
        let mut prop = self.cached_property(device, property).await?;
        match prop.element_mut(element).map(|e| &mut e.value) {
            Some(ElementValue::Number { value: v, .. }) => *v = value,
            _ => return Err(Self::element_not_found(&prop, element)),
        }
        self.send_new_property(&prop).await
    }

    /// Set one text element
    pub async fn set_text(
        &self,
        device: &str,
        property: &str,
        element: &str,
        value: &str,
    ) -> IndiResult<()> {
        let mut prop = self.cached_property(device, property).await?;
        match prop.element_mut(element).map(|e| &mut e.value) {
            Some(ElementValue::Text(v)) => *v = value.to_string(),
            _ => return Err(Self::element_not_found(&prop, element)),
        }
        self.send_new_property(&prop).await
    }

    // =========================================================================
    // HIGH-LEVEL DEVICE CONTROL METHODS
    // =========================================================================

    /// Connect to a device (turn on CONNECTION switch)
    pub async fn connect_device(&self, device: &str) -> IndiResult<()> {
        self.set_switch(
            device,
            standard_properties::CONNECTION,
            standard_properties::CONNECT,
            true,
        )
        .await
    }

    /// Disconnect from a device
    pub async fn disconnect_device(&self, device: &str) -> IndiResult<()> {
        self.set_switch(
            device,
            standard_properties::CONNECTION,
            standard_properties::DISCONNECT,
            true,
        )
        .await
    }

    /// Check if a device is connected
    pub async fn is_device_connected(&self, device: &str) -> bool {
        self.get_switch(
            device,
            standard_properties::CONNECTION,
            standard_properties::CONNECT,
        )
        .await
        .unwrap_or(false)
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

// =============================================================================
// WIRE PARSING
// =============================================================================

struct VectorFrame {
    defining: bool,
    property: Property,
}

struct ElementFrame {
    name: String,
    label: String,
    value: ElementValue,
    text: String,
}

/// Reader-side parse state plus handles to the shared caches
struct WireSession {
    devices: Arc<RwLock<HashMap<String, IndiDevice>>>,
    properties: Arc<RwLock<PropertyMap>>,
    event_tx: broadcast::Sender<IndiEvent>,
    vector: Option<VectorFrame>,
    element: Option<ElementFrame>,
}

impl WireSession {
    async fn run<R: AsyncRead + Unpin>(mut self, reader: R) -> IndiResult<()> {
        let mut reader = quick_xml::reader::Reader::from_reader(tokio::io::BufReader::new(reader));
        reader.trim_text(true);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into_async(&mut buf).await {
                Ok(Event::Start(e)) => {
                    let (tag, attrs) = decode_start(&e);
                    self.open(&tag, &attrs).await;
                }
                Ok(Event::Empty(e)) => {
                    let (tag, attrs) = decode_start(&e);
                    self.open(&tag, &attrs).await;
                    self.close(&tag).await;
                }
                Ok(Event::Text(e)) => {
                    if let Some(element) = self.element.as_mut() {
                        match e.unescape() {
                            Ok(text) => element.text.push_str(&text),
                            Err(_) => element.text.push_str(&String::from_utf8_lossy(&e)),
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    self.close(&tag).await;
                }
                Ok(Event::Eof) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    return Err(IndiError::ParseError(format!(
                        "{} at byte {}",
                        e,
                        reader.buffer_position()
                    )));
                }
            }
            buf.clear();
        }
    }

    async fn open(&mut self, tag: &str, attrs: &HashMap<String, String>) {
        if tag.ends_with("Vector") && (tag.starts_with("def") || tag.starts_with("set")) {
            self.open_vector(tag, attrs).await;
        } else if tag.starts_with("def") || tag.starts_with("one") {
            self.open_element(tag, attrs);
        } else if tag == "delProperty" {
            self.delete_property(attrs).await;
        } else if tag == "message" {
            if let Some(message) = attrs.get("message") {
                let _ = self.event_tx.send(IndiEvent::Message {
                    device: attrs.get("device").cloned(),
                    message: message.clone(),
                });
            }
        }
    }

    async fn open_vector(&mut self, tag: &str, attrs: &HashMap<String, String>) {
        let Some(kind) = PropertyKind::from_tag(tag) else {
            return;
        };
        let (Some(device), Some(name)) = (attrs.get("device"), attrs.get("name")) else {
            tracing::warn!("INDI {} without device/name attributes ignored", tag);
            return;
        };
        let defining = tag.starts_with("def");

        let mut property = if defining {
            let mut p = Property::new(device, name, kind);
            if let Some(label) = attrs.get("label") {
                p.label = label.clone();
            }
            if let Some(group) = attrs.get("group") {
                p.group = group.clone();
            }
            if let Some(perm) = attrs.get("perm") {
                p.perm = Permission::parse(perm);
            }
            if kind == PropertyKind::Light {
                p.perm = Permission::ReadOnly;
            }
            if let Some(rule) = attrs.get("rule") {
                p.rule = Some(SwitchRule::parse(rule));
            }
            p
        } else {
            match self
                .properties
                .read()
                .await
                .get(&(device.clone(), name.clone()))
            {
                Some(existing) => existing.clone(),
                None => {
                    tracing::debug!("INDI update for undefined property {}.{}", device, name);
                    return;
                }
            }
        };

        if let Some(state) = attrs.get("state") {
            property.state = PropertyState::parse(state);
        }
        if let Some(t) = attrs.get("timeout").and_then(|s| protocol::parse_number(s)) {
            property.timeout = t;
        }

        self.vector = Some(VectorFrame { defining, property });
    }

    fn open_element(&mut self, tag: &str, attrs: &HashMap<String, String>) {
        let Some(frame) = self.vector.as_ref() else {
            return;
        };
        let Some(name) = attrs.get("name") else {
            return;
        };

        let existing = frame.property.element(name);
        let mut value = existing
            .map(|e| e.value.clone())
            .unwrap_or_else(|| ElementValue::empty(frame.property.kind));
        let label = attrs
            .get("label")
            .cloned()
            .or_else(|| existing.map(|e| e.label.clone()))
            .unwrap_or_else(|| name.clone());

        match &mut value {
            ElementValue::Number {
                min,
                max,
                step,
                format,
                ..
            } => {
                if let Some(v) = attrs.get("min").and_then(|s| protocol::parse_number(s)) {
                    *min = v;
                }
                if let Some(v) = attrs.get("max").and_then(|s| protocol::parse_number(s)) {
                    *max = v;
                }
                if let Some(v) = attrs.get("step").and_then(|s| protocol::parse_number(s)) {
                    *step = v;
                }
                if let Some(f) = attrs.get("format") {
                    *format = f.clone();
                }
            }
            ElementValue::Blob { format, size } => {
                if let Some(f) = attrs.get("format") {
                    *format = f.clone();
                }
                *size = attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0);
            }
            _ => {}
        }

        if tag == "oneBLOB" {
            tracing::debug!(
                "Receiving BLOB {}.{}.{}",
                frame.property.device,
                frame.property.name,
                name
            );
        }

        self.element = Some(ElementFrame {
            name: name.clone(),
            label,
            value,
            text: String::new(),
        });
    }

    async fn close(&mut self, tag: &str) {
        if tag.ends_with("Vector") {
            if let Some(frame) = self.vector.take() {
                self.commit(frame).await;
            }
        } else if tag.starts_with("def") || tag.starts_with("one") {
            if let Some(element) = self.element.take() {
                self.finish_element(element);
            }
        }
    }

    fn finish_element(&mut self, element: ElementFrame) {
        let Some(frame) = self.vector.as_mut() else {
            return;
        };
        let ElementFrame {
            name,
            label,
            mut value,
            text,
        } = element;

        match value {
            ElementValue::Blob {
                ref format,
                size,
            } => {
                if !text.is_empty() {
                    match BASE64.decode(text.trim()) {
                        Ok(data) => {
                            let _ = self.event_tx.send(IndiEvent::BlobReceived {
                                device: frame.property.device.clone(),
                                property: frame.property.name.clone(),
                                element: name.clone(),
                                format: validate_blob_format(format, &data),
                                size,
                                data,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to decode BLOB base64 for {}.{}.{}: {}",
                                frame.property.device,
                                frame.property.name,
                                name,
                                e
                            );
                        }
                    }
                }
            }
            ref mut other => other.apply_text(&text),
        }

        frame.property.upsert_element(Element { name, label, value });
    }

    async fn commit(&mut self, frame: VectorFrame) {
        let VectorFrame { defining, property } = frame;
        let device = property.device.clone();
        let name = property.name.clone();
        let kind = property.kind;
        let state = property.state;

        if defining {
            let mut devices = self.devices.write().await;
            if !devices.contains_key(&device) {
                devices.insert(
                    device.clone(),
                    IndiDevice {
                        name: device.clone(),
                        ..Default::default()
                    },
                );
                let _ = self.event_tx.send(IndiEvent::DeviceDefined(device.clone()));
            }
        }

        if name == standard_properties::DRIVER_INFO {
            if let Some(entry) = self.devices.write().await.get_mut(&device) {
                if let Some(driver) = property.text(standard_properties::DRIVER_NAME) {
                    entry.driver_name = Some(driver.to_string());
                }
                if let Some(exec) = property.text(standard_properties::DRIVER_EXEC) {
                    entry.driver_exec = Some(exec.to_string());
                }
            }
        }

        self.properties
            .write()
            .await
            .insert((device.clone(), name.clone()), property);

        let event = if defining {
            IndiEvent::PropertyDefined {
                device,
                property: name,
                kind,
            }
        } else {
            IndiEvent::PropertyUpdated {
                device,
                property: name,
                state,
            }
        };
        let _ = self.event_tx.send(event);
    }

    async fn delete_property(&mut self, attrs: &HashMap<String, String>) {
        let Some(device) = attrs.get("device") else {
            return;
        };

        match attrs.get("name") {
            Some(name) => {
                let removed = self
                    .properties
                    .write()
                    .await
                    .remove(&(device.clone(), name.clone()));
                if removed.is_some() {
                    let _ = self.event_tx.send(IndiEvent::PropertyDeleted {
                        device: device.clone(),
                        property: name.clone(),
                    });
                }
            }
            None => {
                self.properties
                    .write()
                    .await
                    .retain(|(dev, _), _| dev != device);
                if self.devices.write().await.remove(device).is_some() {
                    let _ = self.event_tx.send(IndiEvent::DeviceRemoved(device.clone()));
                }
            }
        }
    }
}

/// Tag name and unescaped attributes of a start/empty element
fn decode_start(e: &BytesStart) -> (String, HashMap<String, String>) {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let attrs = e
        .attributes()
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
            let value = a
                .unescape_value()
                .map(|v| v.to_string())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).to_string());
            (key, value)
        })
        .collect();
    (tag, attrs)
}

/// Validate BLOB format and detect actual format from data
fn validate_blob_format(declared_format: &str, data: &[u8]) -> String {
    let detected: &str = if data.len() >= 6 && &data[0..6] == b"SIMPLE" {
        ".fits"
    } else if data.len() >= 8 && data[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        ".png"
    } else if data.len() >= 3 && data[0..3] == [0xFF, 0xD8, 0xFF] {
        ".jpeg"
    } else {
        declared_format
    };

    if !declared_format.is_empty() && detected != declared_format {
        tracing::debug!(
            "BLOB format mismatch: declared '{}', detected '{}'",
            declared_format,
            detected
        );
    }

    detected.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const DEFINITIONS: &str = r#"
<defSwitchVector device="Telescope Simulator" name="CONNECTION" label="Connection" group="Main Control" state="Idle" perm="rw" rule="OneOfMany" timeout="60">
    <defSwitch name="CONNECT" label="Connect">Off</defSwitch>
    <defSwitch name="DISCONNECT" label="Disconnect">On</defSwitch>
</defSwitchVector>
<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" label="Eq. Coordinates" group="Main Control" state="Idle" perm="rw" timeout="60">
    <defNumber name="RA" label="RA (hh:mm:ss)" format="%010.6m" min="0" max="24" step="0">12:30:00</defNumber>
    <defNumber name="DEC" label="DEC (dd:mm:ss)" format="%010.6m" min="-90" max="90" step="0">45</defNumber>
</defNumberVector>
<defTextVector device="Telescope Simulator" name="DRIVER_INFO" label="Driver Info" group="General Info" state="Idle" perm="ro">
    <defText name="DRIVER_NAME" label="Name">Telescope Simulator</defText>
    <defText name="DRIVER_EXEC" label="Exec">indi_simulator_telescope</defText>
</defTextVector>
<setNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" state="Busy">
    <oneNumber name="DEC">50.25</oneNumber>
</setNumberVector>
<message device="Telescope Simulator" timestamp="2024-01-01T00:00:00" message="Slewing"/>
"#;

    /// Serves `script` to the first client and returns everything the client sent
    async fn fake_server(script: &'static str) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(script.as_bytes()).await.unwrap();
            let mut received = String::new();
            let mut buf = [0u8; 4096];
            let _ = timeout(Duration::from_secs(2), async {
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            received.push_str(&String::from_utf8_lossy(&buf[..n]));
                            if received.contains("newSwitchVector") {
                                break;
                            }
                        }
                    }
                }
            })
            .await;
            received
        });
        (port, handle)
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<IndiEvent>, mut pred: F) -> IndiEvent
    where
        F: FnMut(&IndiEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(event) = rx.recv().await {
                    if pred(&event) {
                        return event;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_parses_definitions_and_updates() {
        let (port, server) = fake_server(DEFINITIONS).await;
        let client = IndiClient::new("127.0.0.1", Some(port));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();

        let event = wait_for(&mut rx, |e| matches!(e, IndiEvent::DeviceDefined(_))).await;
        assert!(matches!(event, IndiEvent::DeviceDefined(name) if name == "Telescope Simulator"));

        wait_for(&mut rx, |e| matches!(e, IndiEvent::Message { .. })).await;

        let coords = client
            .get_property("Telescope Simulator", "EQUATORIAL_EOD_COORD")
            .await
            .unwrap();
        assert_eq!(coords.state, PropertyState::Busy);
        assert_eq!(coords.number("RA"), Some(12.5));
        assert_eq!(coords.number("DEC"), Some(50.25));

        let device = client.get_device("Telescope Simulator").await.unwrap();
        assert_eq!(device.driver_exec.as_deref(), Some("indi_simulator_telescope"));
        assert!(!client.is_device_connected("Telescope Simulator").await);

        client.connect_device("Telescope Simulator").await.unwrap();
        let received = server.await.unwrap();
        assert!(received.contains("<getProperties version=\"1.7\"/>"));
        assert!(received.contains("<oneSwitch name=\"CONNECT\">On</oneSwitch>"));
        assert!(received.contains("<oneSwitch name=\"DISCONNECT\">Off</oneSwitch>"));
    }

    #[tokio::test]
    async fn test_server_eof_reports_abnormal_disconnect() {
        let (port, _server) = fake_server("").await;
        let client = IndiClient::new("127.0.0.1", Some(port));
        let mut rx = client.subscribe();
        client.connect().await.unwrap();

        // The fake server keeps the socket open until its read window closes.
        let event = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(IndiEvent::ServerDisconnected { exit_code }) = rx.recv().await {
                    return exit_code;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, -1);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_read_only_property_rejected() {
        let mut prop = Property::new("Dev", "DRIVER_INFO", PropertyKind::Text);
        prop.perm = Permission::ReadOnly;
        let client = IndiClient::default();
        let err = client.send_new_property(&prop).await.unwrap_err();
        assert!(matches!(err, IndiError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let client = IndiClient::new("localhost", Some(1));
        let prop = Property::new("Dev", "CONNECTION", PropertyKind::Switch);
        let err = client.send_new_property(&prop).await.unwrap_err();
        assert!(matches!(err, IndiError::NotConnected));
    }

    #[test]
    fn test_validate_blob_format() {
        assert_eq!(validate_blob_format(".fits", b"SIMPLE  = T"), ".fits");
        assert_eq!(validate_blob_format(".fits", &[0xFF, 0xD8, 0xFF, 0x00]), ".jpeg");
        assert_eq!(validate_blob_format(".raw", b"xx"), ".raw");
    }
}
