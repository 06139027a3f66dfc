//! INDI driver orchestration
//!
//! Starts `indiserver` processes, feeds them driver commands over a FIFO, opens client
//! sessions against them and tracks which devices each driver produced.
//!
//! ## Layout
//!
//! - [`DriverInfo`]: catalog entry plus runtime state of one driver
//! - [`ServerManager`]: one local `indiserver` process
//! - [`ClientManager`]: one client session against a local or remote server
//! - [`IndiListener`]: unified device registry across all sessions
//! - [`DriverManager`]: groups drivers by host:port and drives the three above

pub mod catalog;
mod client_manager;
mod config;
mod device_info;
mod driver_info;
mod driver_manager;
mod error;
mod generic_device;
mod listener;
pub mod ports;
mod server_manager;

pub use catalog::CustomDriver;
pub use client_manager::{ClientEvent, ClientManager};
pub use config::DriverManagerConfig;
pub use device_info::DeviceInfo;
pub use driver_info::{
    DeviceFamily, DriverHandle, DriverInfo, DriverSource, DriverSummary, AUX_LOCALLY_AVAILABLE,
    AUX_MDPD,
};
pub use driver_manager::{AlwaysRestart, DriverManager, DriverManagerEvent, RestartPrompt};
pub use error::{DriverError, DriverResult};
pub use generic_device::{classify_property, GenericDevice};
pub use listener::{IndiListener, ListenerEvent};
pub use server_manager::{
    start_command, stop_command, DriverCrashDetector, ServerEvent, ServerLog, ServerManager,
    StderrPatternDetector,
};
