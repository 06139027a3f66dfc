use ekos_drivers::DriverError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Ekos requires at least one CCD or Guider to operate.")]
    NoCameraOrGuider,

    #[error("Profile {0} has no drivers")]
    NoProfileDrivers(String),

    #[error("Start already in progress")]
    StartInProgress,

    #[error("No device named {0}")]
    DeviceNotFound(String),

    #[error("Failed to load profile {path}: {reason}")]
    Profile { path: PathBuf, reason: String },

    #[error("Invalid manager configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
