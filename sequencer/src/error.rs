//! Errors raised while preparing or sending a task action

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Device {0} not connected")]
    DeviceNotConnected(String),

    #[error("Property {property} not found on device {device}")]
    PropertyNotFound { device: String, property: String },

    #[error("Element {element} not found in property {property}")]
    ElementNotFound { property: String, element: String },

    #[error("Unsupported property type for {0}")]
    UnsupportedProperty(String),

    #[error("Value {value} cannot be applied to {property}.{element}")]
    InvalidValue {
        property: String,
        element: String,
        value: String,
    },

    #[error("Failed to send {property}: {reason}")]
    SendFailed { property: String, reason: String },

    #[error("Expected a {expected} action, found {found}")]
    WrongActionType { expected: String, found: String },

    #[error("Invalid action JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ActionResult<T> = Result<T, ActionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_target() {
        let err = ActionError::PropertyNotFound {
            device: "CCD Simulator".to_string(),
            property: "CCD_TEMPERATURE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Property CCD_TEMPERATURE not found on device CCD Simulator"
        );

        let err = ActionError::ElementNotFound {
            property: "CONNECTION".to_string(),
            element: "PLUG".to_string(),
        };
        assert_eq!(err.to_string(), "Element PLUG not found in property CONNECTION");
    }
}
