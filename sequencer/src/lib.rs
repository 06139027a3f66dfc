//! Task actions
//!
//! Single-property steps used by a task queue: [`SetAction`] writes an element and
//! waits for the device to confirm it, [`EvaluateAction`] waits for a condition on a
//! property. Devices are reached through the [`DeviceLookup`] trait so the actions stay
//! independent of how devices are discovered.

mod action;
pub mod device_ops;
mod error;
mod evaluate_action;
mod set_action;

pub use action::{value_as_bool, value_as_f64, value_as_string, ActionEvent, ActionStatus, ActionType};
pub use device_ops::{
    broadcast_stream, DeviceLookup, DeviceResult, NullDeviceLookup, PropertyUpdate,
    SharedDeviceLookup, SharedTaskDevice, TaskDevice,
};
pub use error::{ActionError, ActionResult};
pub use evaluate_action::{
    evaluate_bool, evaluate_number, evaluate_state, evaluate_text, Condition, EvaluateAction,
    EvaluateActionConfig, EvaluatePropertyType, ObservedValue,
};
pub use set_action::{
    SetAction, SetActionConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS,
};

/// Decode either action kind from its JSON form
pub enum TaskAction {
    Set(std::sync::Arc<SetAction>),
    Evaluate(std::sync::Arc<EvaluateAction>),
}

impl TaskAction {
    pub fn from_json(json: &serde_json::Value, devices: SharedDeviceLookup) -> ActionResult<Self> {
        let action_type: ActionType = serde_json::from_value(
            json.get("type").cloned().unwrap_or(serde_json::Value::Null),
        )?;
        match action_type {
            ActionType::Set => Ok(TaskAction::Set(SetAction::from_json(json, devices)?)),
            ActionType::Evaluate => Ok(TaskAction::Evaluate(EvaluateAction::from_json(json, devices)?)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TaskAction::Set(action) => action.to_json(),
            TaskAction::Evaluate(action) => action.to_json(),
        }
    }

    pub fn start(&self) {
        match self {
            TaskAction::Set(action) => action.start(),
            TaskAction::Evaluate(action) => action.start(),
        }
    }

    pub fn abort(&self) {
        match self {
            TaskAction::Set(action) => action.abort(),
            TaskAction::Evaluate(action) => action.abort(),
        }
    }

    pub async fn wait(&self) -> ActionStatus {
        match self {
            TaskAction::Set(action) => action.wait().await,
            TaskAction::Evaluate(action) => action.wait().await,
        }
    }

    pub fn status(&self) -> ActionStatus {
        match self {
            TaskAction::Set(action) => action.status(),
            TaskAction::Evaluate(action) => action.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_task_action_dispatches_on_type() {
        let set = json!({
            "type": "SET",
            "device": "Telescope Simulator",
            "property": "TELESCOPE_PARK",
            "element": "PARK",
            "value": true
        });
        let action = TaskAction::from_json(&set, Arc::new(NullDeviceLookup)).unwrap();
        assert!(matches!(action, TaskAction::Set(_)));
        assert_eq!(action.to_json()["element"], "PARK");
        assert_eq!(action.status(), ActionStatus::Idle);

        let evaluate = json!({
            "type": "EVALUATE",
            "device": "Telescope Simulator",
            "property": "TELESCOPE_PARK",
            "element": "PARK",
            "property_type": "SWITCH",
            "condition": "EQUALS",
            "target": true
        });
        let action = TaskAction::from_json(&evaluate, Arc::new(NullDeviceLookup)).unwrap();
        assert!(matches!(action, TaskAction::Evaluate(_)));

        assert!(TaskAction::from_json(&json!({"device": "x"}), Arc::new(NullDeviceLookup)).is_err());
    }
}
