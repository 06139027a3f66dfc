//! INDI Protocol Client
//!
//! Implements the client side of the INDI protocol used to talk to local and remote
//! INDI servers.
//!
//! ## Features
//!
//! - Typed property cache (text, number, switch, light, BLOB) updated from the wire
//! - Broadcast event stream for device/property discovery
//! - Writer task fed through an mpsc channel so the client can be shared behind an `Arc`
//! - Permission and range checks before property writes

mod client;
mod error;
mod property;
pub mod protocol;

pub use client::{IndiClient, IndiEvent};
pub use error::{IndiError, IndiResult};
pub use property::{
    Element, ElementValue, Permission, Property, PropertyKind, PropertyState, SwitchRule,
};
pub use protocol::{standard_properties, BlobMode, INDI_PROTOCOL_VERSION};

use std::time::Duration;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// INDI device information as announced by the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndiDevice {
    pub name: String,
    /// `DRIVER_INFO.DRIVER_NAME`, once the driver has published it
    pub driver_name: Option<String>,
    /// `DRIVER_INFO.DRIVER_EXEC`, once the driver has published it
    pub driver_exec: Option<String>,
}

/// Timeout configuration for INDI operations
#[derive(Debug, Clone)]
pub struct IndiTimeoutConfig {
    /// Connection timeout for initial TCP connection (default: 30 seconds)
    pub connection_timeout_secs: u64,
    /// Channel depth for outbound commands (default: 100)
    pub command_queue_depth: usize,
    /// Broadcast capacity for client events (default: 1024)
    pub event_capacity: usize,
}

impl Default for IndiTimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            command_queue_depth: 100,
            event_capacity: 1024,
        }
    }
}

impl IndiTimeoutConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
