//! EVALUATE task action
//!
//! Waits until a device property satisfies a condition. Nothing is written to the
//! device; a timeout consumes one retry and re-evaluates from scratch.

use crate::action::{
    from_tagged_json, tagged_json, value_as_bool, value_as_f64, value_as_string, watch_property,
    ActionCore, ActionEvent, ActionStatus, ActionType, Check, Trigger, WatchOutcome,
};
use crate::device_ops::SharedDeviceLookup;
use crate::error::ActionResult;
use crate::set_action::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use ekos_indi::{Property, PropertyKind, PropertyState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Absolute tolerance for numeric equality
const NUMERIC_TOLERANCE: f64 = 0.001;

/// How the watched value is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluatePropertyType {
    Number,
    Text,
    Switch,
    Light,
    /// The property's own state (Idle/OK/Busy/Alert), not an element
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    /// `|current - target| <= margin`
    WithinRange,
    Contains,
    StartsWith,
}

impl Condition {
    pub fn describe(&self, margin: f64) -> String {
        match self {
            Condition::Equals => "equals".to_string(),
            Condition::NotEquals => "not equals".to_string(),
            Condition::GreaterThan => "greater than".to_string(),
            Condition::LessThan => "less than".to_string(),
            Condition::GreaterEqual => "greater or equal".to_string(),
            Condition::LessEqual => "less or equal".to_string(),
            Condition::WithinRange => format!("within {} of", margin),
            Condition::Contains => "contains".to_string(),
            Condition::StartsWith => "starts with".to_string(),
        }
    }
}

/// Value read from a property
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedValue {
    Number(f64),
    Text(String),
    Bool(bool),
    State(PropertyState),
}

impl ObservedValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            ObservedValue::Number(v) => Some(*v),
            ObservedValue::Text(s) => s.trim().parse().ok(),
            ObservedValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ObservedValue::State(_) => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            ObservedValue::Number(v) => v.to_string(),
            ObservedValue::Text(s) => s.clone(),
            ObservedValue::Bool(b) => b.to_string(),
            ObservedValue::State(state) => state.as_str().to_string(),
        }
    }

    fn as_bool(&self) -> bool {
        match self {
            ObservedValue::Number(v) => *v != 0.0,
            ObservedValue::Text(s) => value_as_bool(&serde_json::Value::String(s.clone())),
            ObservedValue::Bool(b) => *b,
            ObservedValue::State(_) => false,
        }
    }
}

pub fn evaluate_number(condition: Condition, current: f64, target: f64, margin: f64) -> bool {
    match condition {
        Condition::Equals => (current - target).abs() < NUMERIC_TOLERANCE,
        Condition::NotEquals => (current - target).abs() >= NUMERIC_TOLERANCE,
        Condition::GreaterThan => current > target,
        Condition::LessThan => current < target,
        Condition::GreaterEqual => current >= target,
        Condition::LessEqual => current <= target,
        Condition::WithinRange => (current - target).abs() <= margin,
        Condition::Contains | Condition::StartsWith => false,
    }
}

/// Equality is exact; `Contains`/`StartsWith` ignore case
pub fn evaluate_text(condition: Condition, current: &str, target: &str) -> bool {
    match condition {
        Condition::Equals => current == target,
        Condition::NotEquals => current != target,
        Condition::Contains => current.to_lowercase().contains(&target.to_lowercase()),
        Condition::StartsWith => current.to_lowercase().starts_with(&target.to_lowercase()),
        _ => false,
    }
}

pub fn evaluate_bool(condition: Condition, current: bool, target: bool) -> bool {
    match condition {
        Condition::Equals => current == target,
        Condition::NotEquals => current != target,
        _ => false,
    }
}

pub fn evaluate_state(condition: Condition, current: &str, target: &str) -> bool {
    match condition {
        Condition::Equals => current.eq_ignore_ascii_case(target),
        Condition::NotEquals => !current.eq_ignore_ascii_case(target),
        _ => false,
    }
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

/// Persisted form of an EVALUATE action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateActionConfig {
    pub device: String,
    pub property: String,
    #[serde(default)]
    pub element: String,
    pub property_type: EvaluatePropertyType,
    pub condition: Condition,
    pub target: serde_json::Value,
    #[serde(default)]
    pub margin: f64,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Treat an Idle state as met, for waits whose predecessor step was skipped
    #[serde(default)]
    pub accept_idle_on_skipped_predecessor: bool,
}

impl EvaluateActionConfig {
    pub fn new(
        device: &str,
        property: &str,
        element: &str,
        property_type: EvaluatePropertyType,
        condition: Condition,
        target: serde_json::Value,
    ) -> Self {
        Self {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
            property_type,
            condition,
            target,
            margin: 0.0,
            timeout: default_timeout(),
            retries: default_retries(),
            poll_interval_ms: default_poll_interval(),
            accept_idle_on_skipped_predecessor: false,
        }
    }

    fn target_label(&self) -> String {
        format!("{}.{}.{}", self.device, self.property, self.element)
    }
}

pub struct EvaluateAction {
    config: EvaluateActionConfig,
    devices: SharedDeviceLookup,
    core: ActionCore,
}

impl EvaluateAction {
    pub fn new(config: EvaluateActionConfig, devices: SharedDeviceLookup) -> Arc<Self> {
        let core = ActionCore::new(config.retries);
        Arc::new(Self {
            config,
            devices,
            core,
        })
    }

    pub fn config(&self) -> &EvaluateActionConfig {
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

    pub async fn wait(&self) -> ActionStatus {
        self.core.wait().await
    }

    pub fn start(self: &Arc<Self>) {
        self.core.reset();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        self.core.replace_task(handle);
    }

    pub async fn execute(&self) -> ActionStatus {
        self.core.reset();
        self.run().await
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    async fn run(&self) -> ActionStatus {
        let target = self.config.target_label();

        loop {
            if self.core.is_aborted() {
                return ActionStatus::Aborted;
            }

            let Some(device) = self.devices.find_device(&self.config.device).await else {
                return self
                    .core
                    .fail(format!("Device {} not found", self.config.device));
            };
            if !device.is_connected().await {
                return self
                    .core
                    .fail(format!("Device {} not connected", self.config.device));
            }

            let updates = device.updates();
            if self.is_already_done().await {
                self.core
                    .progress(format!("{} condition already met, skipping", target));
                return self.core.complete();
            }

            self.core.set_status(ActionStatus::Running);
            self.core.emit(ActionEvent::Started);
            self.core.progress(format!(
                "Evaluating {} {} {}",
                target,
                self.config.condition.describe(self.config.margin),
                value_as_string(&self.config.target)
            ));

            self.core.hold_device(device.clone());
            let outcome = watch_property(
                &device,
                updates,
                &self.config.property,
                Duration::from_millis(self.config.poll_interval_ms),
                Duration::from_secs_f64(self.config.timeout),
                self.core.status_receiver(),
                |trigger, property| {
                    let state = match trigger {
                        Trigger::Update(state) => Some(state),
                        Trigger::Poll => None,
                    };
                    match property {
                        Some(property) if self.condition_met(property, state) => Check::Done,
                        _ => Check::Waiting,
                    }
                },
            )
            .await;

            match outcome {
                WatchOutcome::Done => {
                    self.core.progress(format!("{} condition met", target));
                    return self.core.complete();
                }
                WatchOutcome::Alert | WatchOutcome::Timeout => {
                    if self.core.increment_retry() {
                        self.core.progress(format!(
                            "Timeout, retry {}/{}",
                            self.core.current_retry(),
                            self.core.retries()
                        ));
                        continue;
                    }
                    return self.core.fail(format!(
                        "Timeout evaluating {}.{}",
                        self.config.property, self.config.element
                    ));
                }
                WatchOutcome::Aborted => return ActionStatus::Aborted,
            }
        }
    }

    pub async fn is_already_done(&self) -> bool {
        let Some(property) = self.current_property().await else {
            return false;
        };
        if self.config.property_type == EvaluatePropertyType::State
            && self.config.accept_idle_on_skipped_predecessor
            && property.state == PropertyState::Idle
        {
            return true;
        }
        self.condition_met(&property, None)
    }

    /// Current value of the watched element, or of the property state
    pub async fn current_value(&self) -> Option<ObservedValue> {
        let property = self.current_property().await?;
        self.observe(&property, None)
    }

    async fn current_property(&self) -> Option<Property> {
        let device = self.devices.find_device(&self.config.device).await?;
        if !device.is_connected().await {
            return None;
        }
        device.property(&self.config.property).await
    }

    fn observe(&self, property: &Property, state: Option<PropertyState>) -> Option<ObservedValue> {
        if self.config.property_type == EvaluatePropertyType::State {
            return Some(ObservedValue::State(state.unwrap_or(property.state)));
        }
        let element = &self.config.element;
        match property.kind {
            PropertyKind::Number => property.number(element).map(ObservedValue::Number),
            PropertyKind::Text => property
                .text(element)
                .map(|text| ObservedValue::Text(text.to_string())),
            PropertyKind::Switch => property.switch(element).map(ObservedValue::Bool),
            PropertyKind::Light => property
                .light(element)
                .map(|light| ObservedValue::Bool(matches!(light, PropertyState::Ok | PropertyState::Busy))),
            PropertyKind::Blob => None,
        }
    }

    fn condition_met(&self, property: &Property, state: Option<PropertyState>) -> bool {
        let Some(current) = self.observe(property, state) else {
            return false;
        };
        let condition = self.config.condition;
        let target = &self.config.target;
        match self.config.property_type {
            EvaluatePropertyType::Number => match (current.as_number(), value_as_f64(target)) {
                (Some(current), Some(target)) => {
                    evaluate_number(condition, current, target, self.config.margin)
                }
                _ => false,
            },
            EvaluatePropertyType::Text => {
                evaluate_text(condition, &current.as_text(), &value_as_string(target))
            }
            EvaluatePropertyType::Switch | EvaluatePropertyType::Light => {
                evaluate_bool(condition, current.as_bool(), value_as_bool(target))
            }
            EvaluatePropertyType::State => {
                evaluate_state(condition, &current.as_text(), &value_as_string(target))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        tagged_json(ActionType::Evaluate, &self.config)
    }

    pub fn from_json(
        json: &serde_json::Value,
        devices: SharedDeviceLookup,
    ) -> ActionResult<Arc<Self>> {
        let config: EvaluateActionConfig = from_tagged_json(ActionType::Evaluate, json)?;
        Ok(Self::new(config, devices))
    }
}
