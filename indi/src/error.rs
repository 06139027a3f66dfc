//! INDI error types
//!
//! Provides structured error types for INDI client operations.

use std::fmt;
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone)]
pub enum IndiError {
    /// Connection to INDI server failed
    ConnectionFailed(String),
    /// Connection timeout with context
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// Not connected to server
    NotConnected,
    /// Channel closed (writer task gone)
    ChannelClosed(String),
    /// XML parse error
    ParseError(String),
    /// Device has not been announced by the server
    DeviceNotFound(String),
    /// Property not found
    PropertyNotFound { device: String, property: String },
    /// Element not found inside a property
    ElementNotFound {
        device: String,
        property: String,
        element: String,
    },
    /// Permission denied (attempted to write to read-only property)
    PermissionDenied(String),
    /// Value out of range for number property
    ValueOutOfRange {
        device: String,
        property: String,
        element: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Property kind does not support the requested operation
    UnsupportedProperty { property: String, kind: String },
    /// I/O error on the socket
    Io(String),
}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            IndiError::ConnectionTimeout {
                host,
                port,
                duration,
            } => {
                write!(
                    f,
                    "Connection to {}:{} timed out after {:.1}s",
                    host,
                    port,
                    duration.as_secs_f64()
                )
            }
            IndiError::NotConnected => write!(f, "Not connected to INDI server"),
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IndiError::ParseError(msg) => write!(f, "XML parse error: {}", msg),
            IndiError::DeviceNotFound(device) => write!(f, "Device not found: {}", device),
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::ElementNotFound {
                device,
                property,
                element,
            } => {
                write!(f, "Element not found: {}.{}.{}", device, property, element)
            }
            IndiError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            IndiError::ValueOutOfRange {
                device,
                property,
                element,
                value,
                min,
                max,
            } => {
                write!(
                    f,
                    "Value {} out of range [{}, {}] for {}.{}.{}",
                    value, min, max, device, property, element
                )
            }
            IndiError::UnsupportedProperty { property, kind } => {
                write!(f, "Property {} of type {} cannot be written", property, kind)
            }
            IndiError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for IndiError {}

impl From<std::io::Error> for IndiError {
    fn from(err: std::io::Error) -> Self {
        IndiError::Io(err.to_string())
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
