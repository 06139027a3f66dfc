//! Ekos equipment manager
//!
//! Composition root of the workspace: turns an equipment profile into running INDI
//! drivers through [`ekos_drivers::DriverManager`], tracks device readiness, and exposes
//! the live devices to task actions from [`ekos_sequencer`].
//!
//! ## Layout
//!
//! - [`ProfileInfo`]: which driver fills which equipment role
//! - [`EkosManager`]: start/stop state machine with device countdown and timeout
//! - [`ListenerDeviceLookup`]: sequencer device traits over the live device list

pub mod config;
pub mod device_ops;
mod error;
pub mod logging;
mod manager;
pub mod profile;
pub mod readiness;

pub use config::{ConfigOnConnect, ManagerConfig};
pub use device_ops::{IndiTaskDevice, ListenerDeviceLookup};
pub use error::{ManagerError, ManagerResult};
pub use manager::{CommunicationStatus, EkosManager, ManagerEvent};
pub use profile::{ProfileInfo, RemoteDriver, Role};
pub use readiness::{CountdownStep, DeviceCountdown};
