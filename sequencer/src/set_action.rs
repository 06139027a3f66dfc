//! SET task action
//!
//! Writes one element of one device property and optionally waits until the device
//! confirms it. The write is skipped when the element already holds the target value.

use crate::action::{
    from_tagged_json, tagged_json, value_as_bool, value_as_f64, value_as_string, watch_property,
    ActionCore, ActionEvent, ActionStatus, ActionType, Check, Trigger, WatchOutcome,
};
use crate::device_ops::{SharedDeviceLookup, SharedTaskDevice};
use crate::error::{ActionError, ActionResult};
use ekos_indi::{ElementValue, Property, PropertyKind, PropertyState, SwitchRule};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Absolute tolerance when comparing number elements
const NUMBER_TOLERANCE: f64 = 0.01;

fn default_wait_for_completion() -> bool {
    true
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Persisted form of a SET action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetActionConfig {
    pub device: String,
    pub property: String,
    pub element: String,
    pub value: serde_json::Value,
    #[serde(default = "default_wait_for_completion")]
    pub wait_for_completion: bool,
    /// Seconds to wait for confirmation per attempt
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl SetActionConfig {
    pub fn new(device: &str, property: &str, element: &str, value: serde_json::Value) -> Self {
        Self {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
            value,
            wait_for_completion: default_wait_for_completion(),
            timeout: default_timeout(),
            retries: default_retries(),
            poll_interval_ms: default_poll_interval(),
        }
    }

    fn target(&self) -> String {
        format!("{}.{}.{}", self.device, self.property, self.element)
    }
}

pub struct SetAction {
    config: SetActionConfig,
    devices: SharedDeviceLookup,
    core: ActionCore,
}

impl SetAction {
    pub fn new(config: SetActionConfig, devices: SharedDeviceLookup) -> Arc<Self> {
        let core = ActionCore::new(config.retries);
        Arc::new(Self {
            config,
            devices,
            core,
        })
    }

    pub fn config(&self) -> &SetActionConfig {
        &self.config
    }

    pub fn status(&self) -> ActionStatus {
        self.core.status()
    }

    pub fn error_message(&self) -> Option<String> {
        self.core.error_message()
    }

    pub fn current_retry(&self) -> u32 {
        self.core.current_retry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.core.subscribe()
    }

    /// Wait until the current run ends
    pub async fn wait(&self) -> ActionStatus {
        self.core.wait().await
    }

    /// Run in the background; follow with [`wait`](Self::wait) or [`subscribe`](Self::subscribe)
    pub fn start(self: &Arc<Self>) {
        self.core.reset();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        self.core.replace_task(handle);
    }

    /// Run to a terminal status on the caller's task
    pub async fn execute(&self) -> ActionStatus {
        self.core.reset();
        self.run().await
    }

    /// Stop waiting and release the device. Safe from any state.
    pub fn abort(&self) {
        tracing::info!("SET action {} aborted", self.config.target());
        self.core.abort();
    }

    async fn run(&self) -> ActionStatus {
        let target = self.config.target();
        tracing::info!(
            "SET action starting: {} = {}",
            target,
            value_as_string(&self.config.value)
        );

        loop {
            if self.core.is_aborted() {
                return ActionStatus::Aborted;
            }

            if self.is_already_done().await {
                self.core
                    .progress(format!("{} already at target value, skipping", target));
                return self.core.complete();
            }

            self.core.set_status(ActionStatus::Running);
            self.core.emit(ActionEvent::Started);
            self.core.progress(format!(
                "Setting {} to {}",
                target,
                value_as_string(&self.config.value)
            ));

            let sent = match self.resolve_device().await {
                Ok(device) => {
                    let updates = device.updates();
                    self.send_set_command(&device).await.map(|_| (device, updates))
                }
                Err(e) => Err(e),
            };
            let (device, updates) = match sent {
                Ok(sent) => sent,
                Err(e) => {
                    tracing::warn!("Failed to send SET command: {}", e);
                    if self.core.increment_retry() {
                        self.core.progress(format!(
                            "Retry {}/{}",
                            self.core.current_retry(),
                            self.core.retries()
                        ));
                        continue;
                    }
                    return self
                        .core
                        .fail("Failed to send SET command after all retries".to_string());
                }
            };
            tracing::info!("SET command sent successfully");

            if !self.config.wait_for_completion {
                return self.core.complete();
            }

            self.core.hold_device(device.clone());
            let outcome = watch_property(
                &device,
                updates,
                &self.config.property,
                Duration::from_millis(self.config.poll_interval_ms),
                Duration::from_secs_f64(self.config.timeout),
                self.core.status_receiver(),
                |trigger, property| self.completion(trigger, property),
            )
            .await;

            match outcome {
                WatchOutcome::Done => {
                    self.core.progress(format!("{} confirmed", target));
                    return self.core.complete();
                }
                WatchOutcome::Alert => {
                    if self.core.increment_retry() {
                        self.core.progress(format!(
                            "Property in Alert state, retry {}/{}",
                            self.core.current_retry(),
                            self.core.retries()
                        ));
                        continue;
                    }
                    return self.core.fail("Property entered Alert state".to_string());
                }
                WatchOutcome::Timeout => {
                    tracing::warn!(
                        "Timeout waiting for {}.{}",
                        self.config.property,
                        self.config.element
                    );
                    if self.core.increment_retry() {
                        self.core.progress(format!(
                            "Timeout, retry {}/{}",
                            self.core.current_retry(),
                            self.core.retries()
                        ));
                        continue;
                    }
                    return self.core.fail(format!(
                        "Timeout waiting for {}.{} to complete",
                        self.config.property, self.config.element
                    ));
                }
                WatchOutcome::Aborted => return ActionStatus::Aborted,
            }
        }
    }

    /// True when the element already holds the target value
    pub async fn is_already_done(&self) -> bool {
        let Some(device) = self.devices.find_device(&self.config.device).await else {
            return false;
        };
        if !device.is_connected().await {
            return false;
        }
        match device.property(&self.config.property).await {
            Some(property) => self.value_matches(&property),
            None => false,
        }
    }

    fn value_matches(&self, property: &Property) -> bool {
        let element = &self.config.element;
        let value = &self.config.value;
        match property.kind {
            PropertyKind::Number => match (property.number(element), value_as_f64(value)) {
                (Some(current), Some(target)) => (current - target).abs() < NUMBER_TOLERANCE,
                _ => false,
            },
            PropertyKind::Switch => property
                .switch(element)
                .is_some_and(|on| on == value_as_bool(value)),
            PropertyKind::Text => property
                .text(element)
                .is_some_and(|text| text == value_as_string(value)),
            PropertyKind::Light | PropertyKind::Blob => false,
        }
    }

    fn completion(&self, trigger: Trigger, property: Option<&Property>) -> Check {
        let Some(property) = property else {
            return match trigger {
                Trigger::Poll => Check::Lost,
                Trigger::Update(_) => Check::Waiting,
            };
        };
        let state = match trigger {
            Trigger::Update(state) => state,
            Trigger::Poll => property.state,
        };
        match state {
            PropertyState::Ok | PropertyState::Idle if self.value_matches(property) => Check::Done,
            PropertyState::Ok | PropertyState::Idle | PropertyState::Busy => Check::Waiting,
            PropertyState::Alert => Check::Alert,
        }
    }

    async fn resolve_device(&self) -> ActionResult<SharedTaskDevice> {
        let device = self
            .devices
            .find_device(&self.config.device)
            .await
            .ok_or_else(|| ActionError::DeviceNotFound(self.config.device.clone()))?;
        if !device.is_connected().await {
            return Err(ActionError::DeviceNotConnected(self.config.device.clone()));
        }
        Ok(device)
    }

    async fn send_set_command(&self, device: &SharedTaskDevice) -> ActionResult<()> {
        let config = &self.config;
        let mut property = device.property(&config.property).await.ok_or_else(|| {
            ActionError::PropertyNotFound {
                device: config.device.clone(),
                property: config.property.clone(),
            }
        })?;

        let element_missing = || ActionError::ElementNotFound {
            property: config.property.clone(),
            element: config.element.clone(),
        };
        let invalid_value = || ActionError::InvalidValue {
            property: config.property.clone(),
            element: config.element.clone(),
            value: value_as_string(&config.value),
        };

        match property.kind {
            PropertyKind::Number => {
                let target = value_as_f64(&config.value).ok_or_else(invalid_value)?;
                let element = property
                    .element_mut(&config.element)
                    .ok_or_else(element_missing)?;
                match &mut element.value {
                    ElementValue::Number { value, .. } => *value = target,
                    _ => return Err(invalid_value()),
                }
            }
            PropertyKind::Switch => {
                if property.element(&config.element).is_none() {
                    return Err(element_missing());
                }
                if property.rule != Some(SwitchRule::AnyOfMany) {
                    property.reset_switches();
                }
                if let Some(element) = property.element_mut(&config.element) {
                    element.value = ElementValue::Switch(value_as_bool(&config.value));
                }
            }
            PropertyKind::Text => {
                let element = property
                    .element_mut(&config.element)
                    .ok_or_else(element_missing)?;
                element.value = ElementValue::Text(value_as_string(&config.value));
            }
            PropertyKind::Light | PropertyKind::Blob => {
                return Err(ActionError::UnsupportedProperty(config.property.clone()));
            }
        }

        device
            .send_property(&property)
            .await
            .map_err(|reason| ActionError::SendFailed {
                property: config.property.clone(),
                reason,
            })
    }

    pub fn to_json(&self) -> serde_json::Value {
        tagged_json(ActionType::Set, &self.config)
    }

    pub fn from_json(
        json: &serde_json::Value,
        devices: SharedDeviceLookup,
    ) -> ActionResult<Arc<Self>> {
        let config: SetActionConfig = from_tagged_json(ActionType::Set, json)?;
        Ok(Self::new(config, devices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::mock::{MockDevice, MockLookup, Reaction};
    use crate::device_ops::NullDeviceLookup;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    const CCD: &str = "CCD Simulator";

    fn fast(mut config: SetActionConfig) -> SetActionConfig {
        config.poll_interval_ms = 20;
        config.timeout = 0.2;
        config
    }

    fn temperature_action(device: &Arc<MockDevice>, target: f64, retries: u32) -> Arc<SetAction> {
        let mut config = fast(SetActionConfig::new(
            CCD,
            "CCD_TEMPERATURE",
            "CCD_TEMPERATURE_VALUE",
            json!(target),
        ));
        config.retries = retries;
        SetAction::new(config, MockLookup::new(vec![device.clone()]))
    }

    fn cooled_ccd(current: f64) -> Arc<MockDevice> {
        MockDevice::new(CCD).with_number("CCD_TEMPERATURE", "CCD_TEMPERATURE_VALUE", current)
    }

    #[tokio::test]
    async fn test_switch_already_on_completes_without_write() {
        let device = MockDevice::new(CCD).with_switches(
            "CONNECTION",
            SwitchRule::OneOfMany,
            &[("CONNECT", true), ("DISCONNECT", false)],
        );
        let action = SetAction::new(
            SetActionConfig::new(CCD, "CONNECTION", "CONNECT", json!(true)),
            MockLookup::new(vec![device.clone()]),
        );

        assert_eq!(action.execute().await, ActionStatus::Completed);
        assert_eq!(device.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_number_within_tolerance_is_already_done() {
        let device = cooled_ccd(-9.995);
        let action = temperature_action(&device, -10.0, 3);
        assert!(action.is_already_done().await);
        assert_eq!(action.execute().await, ActionStatus::Completed);
        assert_eq!(device.send_attempts(), 0);

        let device = cooled_ccd(-9.98);
        let action = temperature_action(&device, -10.0, 3);
        assert!(!action.is_already_done().await);
    }

    #[tokio::test]
    async fn test_send_failures_then_success() {
        let device = cooled_ccd(20.0);
        device.fail_next_sends(2);
        let action = temperature_action(&device, -10.0, 2);

        assert_eq!(action.execute().await, ActionStatus::Completed);
        assert_eq!(device.send_attempts(), 3);
        assert_eq!(action.current_retry(), 2);
        assert_eq!(device.sent()[0].number("CCD_TEMPERATURE_VALUE"), Some(-10.0));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let device = cooled_ccd(20.0);
        device.fail_next_sends(100);
        let action = temperature_action(&device, -10.0, 3);
        let mut events = action.subscribe();

        assert_eq!(action.execute().await, ActionStatus::Failed);
        assert_eq!(device.send_attempts(), 4);
        assert_eq!(action.current_retry(), 3);
        assert_eq!(
            action.error_message().as_deref(),
            Some("Failed to send SET command after all retries")
        );

        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ActionEvent::Progress(message) = event {
                if message.starts_with("Retry") {
                    retries.push(message);
                }
            }
        }
        assert_eq!(retries, vec!["Retry 1/3", "Retry 2/3", "Retry 3/3"]);
    }

    #[tokio::test]
    async fn test_alert_state_retries_then_fails() {
        let device = cooled_ccd(20.0);
        device.set_reaction(Reaction::Alert);
        let action = temperature_action(&device, -10.0, 1);

        assert_eq!(action.execute().await, ActionStatus::Failed);
        assert_eq!(device.send_attempts(), 2);
        assert_eq!(
            action.error_message().as_deref(),
            Some("Property entered Alert state")
        );
    }

    #[tokio::test]
    async fn test_busy_property_times_out() {
        let device = cooled_ccd(20.0);
        device.set_reaction(Reaction::Busy);
        let action = temperature_action(&device, -10.0, 1);

        assert_eq!(action.execute().await, ActionStatus::Failed);
        assert_eq!(device.send_attempts(), 2);
        assert_eq!(
            action.error_message().as_deref(),
            Some("Timeout waiting for CCD_TEMPERATURE.CCD_TEMPERATURE_VALUE to complete")
        );
    }

    #[tokio::test]
    async fn test_poll_detects_silent_completion() {
        let device = cooled_ccd(20.0);
        device.set_reaction(Reaction::ApplySilently);
        let action = temperature_action(&device, -10.0, 0);

        assert_eq!(action.execute().await, ActionStatus::Completed);
        assert_eq!(device.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_lost_device_counts_as_timeout() {
        let device = cooled_ccd(20.0);
        device.set_reaction(Reaction::Busy);
        let mut config = fast(SetActionConfig::new(
            CCD,
            "CCD_TEMPERATURE",
            "CCD_TEMPERATURE_VALUE",
            json!(-10.0),
        ));
        config.timeout = 10.0;
        config.retries = 0;
        let action = SetAction::new(config, MockLookup::new(vec![device.clone()]));

        action.start();
        while device.send_attempts() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        device.set_connected(false);

        let status = timeout(Duration::from_secs(2), action.wait()).await.unwrap();
        assert_eq!(status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_switch_rule_resets_siblings() {
        let device = MockDevice::new(CCD)
            .with_switches(
                "CONNECTION",
                SwitchRule::OneOfMany,
                &[("CONNECT", false), ("DISCONNECT", true)],
            )
            .with_switches(
                "CCD_OPTIONS",
                SwitchRule::AnyOfMany,
                &[("FAN", true), ("HEATER", false)],
            );
        let lookup = MockLookup::new(vec![device.clone()]);

        let connect = SetAction::new(
            fast(SetActionConfig::new(CCD, "CONNECTION", "CONNECT", json!(true))),
            lookup.clone(),
        );
        assert_eq!(connect.execute().await, ActionStatus::Completed);
        let sent = &device.sent()[0];
        assert_eq!(sent.switch("CONNECT"), Some(true));
        assert_eq!(sent.switch("DISCONNECT"), Some(false));

        let heater = SetAction::new(
            fast(SetActionConfig::new(CCD, "CCD_OPTIONS", "HEATER", json!("On"))),
            lookup,
        );
        assert_eq!(heater.execute().await, ActionStatus::Completed);
        let sent = &device.sent()[1];
        assert_eq!(sent.switch("FAN"), Some(true));
        assert_eq!(sent.switch("HEATER"), Some(true));
    }

    #[tokio::test]
    async fn test_text_write_without_waiting() {
        let device = MockDevice::new(CCD).with_text("FILTER_NAME", "FILTER_SLOT_NAME_1", "L");
        device.set_reaction(Reaction::Busy);
        let mut config = SetActionConfig::new(CCD, "FILTER_NAME", "FILTER_SLOT_NAME_1", json!("Ha"));
        config.wait_for_completion = false;
        let action = SetAction::new(config, MockLookup::new(vec![device.clone()]));

        assert_eq!(action.execute().await, ActionStatus::Completed);
        assert_eq!(device.sent()[0].text("FILTER_SLOT_NAME_1"), Some("Ha"));
    }

    #[tokio::test]
    async fn test_abort_while_waiting() {
        let device = cooled_ccd(20.0);
        device.set_reaction(Reaction::Busy);
        let mut config = fast(SetActionConfig::new(
            CCD,
            "CCD_TEMPERATURE",
            "CCD_TEMPERATURE_VALUE",
            json!(-10.0),
        ));
        config.timeout = 10.0;
        let action = SetAction::new(config, MockLookup::new(vec![device.clone()]));

        action.start();
        while device.send_attempts() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        action.abort();

        assert_eq!(action.wait().await, ActionStatus::Aborted);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(action.status(), ActionStatus::Aborted);
        assert_eq!(device.send_attempts(), 1);
        assert!(action.error_message().is_none());
    }

    #[tokio::test]
    async fn test_missing_device_fails_after_retries() {
        let mut config = SetActionConfig::new("Dome Simulator", "DOME_SHUTTER", "SHUTTER_OPEN", json!(true));
        config.retries = 1;
        let action = SetAction::new(config, Arc::new(NullDeviceLookup));

        assert_eq!(action.execute().await, ActionStatus::Failed);
        assert_eq!(action.current_retry(), 1);
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let mut config = SetActionConfig::new(CCD, "CCD_TEMPERATURE", "CCD_TEMPERATURE_VALUE", json!(-10.5));
        config.wait_for_completion = false;
        config.timeout = 120.0;
        let action = SetAction::new(config, Arc::new(NullDeviceLookup));

        let json = action.to_json();
        assert_eq!(json["type"], "SET");
        assert_eq!(json["wait_for_completion"], false);

        let restored = SetAction::from_json(&json, Arc::new(NullDeviceLookup)).unwrap();
        assert_eq!(restored.config(), action.config());
    }

    #[test]
    fn test_json_defaults_and_type_check() {
        let json = json!({
            "type": "SET",
            "device": CCD,
            "property": "CONNECTION",
            "element": "CONNECT",
            "value": true
        });
        let action = SetAction::from_json(&json, Arc::new(NullDeviceLookup)).unwrap();
        assert!(action.config().wait_for_completion);
        assert_eq!(action.config().retries, DEFAULT_RETRIES);
        assert_eq!(action.config().timeout, DEFAULT_TIMEOUT_SECS);

        let mut wrong = json.clone();
        wrong["type"] = json!("EVALUATE");
        assert!(matches!(
            SetAction::from_json(&wrong, Arc::new(NullDeviceLookup)),
            Err(ActionError::WrongActionType { .. })
        ));
    }
}
