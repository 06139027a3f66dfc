//! Error types for driver orchestration

use ekos_indi::IndiError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Failed to create FIFO {path}: {reason}")]
    FifoCreation { path: PathBuf, reason: String },

    #[error("Failed to start INDI server on port {port}: {reason}")]
    ServerStart { port: u16, reason: String },

    #[error("INDI server on port {0} is not running")]
    ServerNotRunning(u16),

    #[error("Driver {driver} failed to start: {exec} not found in search path")]
    ExecutableNotFound { driver: String, exec: String },

    #[error("Failed to write to INDI server FIFO: {0}")]
    FifoWrite(String),

    #[error("Port {0} is not available")]
    PortUnavailable(u16),

    #[error("Cannot start INDI server: no available port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Connection to INDI server at host {host} with port {port} failed after {attempts} attempts")]
    ConnectionFailed {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("Failed to start drivers on {host}:{port} ({}): {reason}", drivers.join(", "))]
    GroupStartFailed {
        host: String,
        port: u16,
        drivers: Vec<String>,
        reason: String,
    },

    #[error("Restart of running driver {0} declined")]
    RestartDeclined(String),

    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    #[error("Catalog error in {path}: {reason}")]
    Catalog { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Indi(#[from] IndiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
