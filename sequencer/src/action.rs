//! Shared task-action machinery
//!
//! Both action kinds follow the same lifecycle: `Idle → Running → {Completed | Failed |
//! Aborted}`, with retries re-entering `Running`. Completion is detected by one check
//! function fed from two triggers, a property-update stream and a poll timer, raced
//! against a timeout.

use crate::device_ops::{PropertyUpdate, SharedTaskDevice};
use crate::error::{ActionError, ActionResult};
use ekos_indi::{Property, PropertyState};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Status of a task action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Aborted
        )
    }
}

/// Event emitted by an action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionEvent {
    StatusChanged(ActionStatus),
    Started,
    Progress(String),
    Completed,
    Failed(String),
}

/// Serialized action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "EVALUATE")]
    Evaluate,
}

// =============================================================================
// VALUE COERCION
// =============================================================================

/// Numeric view of a JSON value; numeric strings are accepted
pub fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Boolean view of a JSON value. Strings are false only when empty, "0", "false" or
/// "off".
pub fn value_as_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        serde_json::Value::String(s) => {
            let s = s.trim();
            !(s.is_empty()
                || s == "0"
                || s.eq_ignore_ascii_case("false")
                || s.eq_ignore_ascii_case("off"))
        }
        _ => false,
    }
}

pub fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Serialize an action configuration with its `type` tag
pub(crate) fn tagged_json<T: Serialize>(action_type: ActionType, config: &T) -> serde_json::Value {
    let mut json = serde_json::to_value(config).unwrap_or_else(|_| serde_json::json!({}));
    if let serde_json::Value::Object(map) = &mut json {
        map.insert(
            "type".to_string(),
            serde_json::to_value(action_type).unwrap_or(serde_json::Value::Null),
        );
    }
    json
}

/// Decode an action configuration; a `type` tag, when present, must match
pub(crate) fn from_tagged_json<T: DeserializeOwned>(
    expected: ActionType,
    json: &serde_json::Value,
) -> ActionResult<T> {
    if let Some(tag) = json.get("type") {
        let found: ActionType = serde_json::from_value(tag.clone())?;
        if found != expected {
            return Err(ActionError::WrongActionType {
                expected: value_as_string(&serde_json::to_value(expected)?),
                found: value_as_string(tag),
            });
        }
    }
    Ok(serde_json::from_value(json.clone())?)
}

// =============================================================================
// COMPLETION WATCH
// =============================================================================

/// What woke the completion check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// The device announced a new state for the watched property
    Update(PropertyState),
    Poll,
}

/// Verdict of one completion check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Check {
    Done,
    Alert,
    Waiting,
    /// Device or property vanished
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchOutcome {
    Done,
    Alert,
    Timeout,
    Aborted,
}

/// Wait until `check` reports a verdict for `property`, the timeout elapses or the
/// action is aborted. A lost device counts as a timeout. `updates` should be taken from
/// the device before the triggering write so no reply is missed.
pub(crate) async fn watch_property<F>(
    device: &SharedTaskDevice,
    mut updates: BoxStream<'static, PropertyUpdate>,
    property: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut status_rx: watch::Receiver<ActionStatus>,
    check: F,
) -> WatchOutcome
where
    F: Fn(Trigger, Option<&Property>) -> Check,
{
    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut updates_open = true;

    loop {
        let verdict = tokio::select! {
            _ = &mut deadline => return WatchOutcome::Timeout,
            _ = async {
                let _ = status_rx.wait_for(|s| *s == ActionStatus::Aborted).await;
            } => return WatchOutcome::Aborted,
            update = updates.next(), if updates_open => {
                match update {
                    Some(update) if update.property == property => {
                        let current = device.property(property).await;
                        check(Trigger::Update(update.state), current.as_ref())
                    }
                    Some(_) => continue,
                    None => {
                        updates_open = false;
                        continue;
                    }
                }
            }
            _ = ticker.tick() => {
                let current = if device.is_connected().await {
                    device.property(property).await
                } else {
                    None
                };
                check(Trigger::Poll, current.as_ref())
            }
        };

        match verdict {
            Check::Done => return WatchOutcome::Done,
            Check::Alert => return WatchOutcome::Alert,
            Check::Lost => return WatchOutcome::Timeout,
            Check::Waiting => {}
        }
    }
}

// =============================================================================
// ACTION CORE
// =============================================================================

/// Status, retry budget and bookkeeping shared by every action kind
pub(crate) struct ActionCore {
    retries: u32,
    current_retry: AtomicU32,
    status_tx: watch::Sender<ActionStatus>,
    event_tx: broadcast::Sender<ActionEvent>,
    error_message: Mutex<Option<String>>,
    device: Mutex<Option<SharedTaskDevice>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActionCore {
    pub fn new(retries: u32) -> Self {
        let (status_tx, _) = watch::channel(ActionStatus::Idle);
        let (event_tx, _) = broadcast::channel(64);
        Self {
            retries,
            current_retry: AtomicU32::new(0),
            status_tx,
            event_tx,
            error_message: Mutex::new(None),
            device: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ActionStatus {
        *self.status_tx.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ActionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.event_tx.subscribe()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn current_retry(&self) -> u32 {
        self.current_retry.load(Ordering::SeqCst)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to `status`. Once aborted, only a reset to Idle is accepted.
    pub fn set_status(&self, status: ActionStatus) -> bool {
        if self.status() == ActionStatus::Aborted && status != ActionStatus::Idle {
            return false;
        }
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            let _ = self.event_tx.send(ActionEvent::StatusChanged(status));
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == ActionStatus::Aborted
    }

    pub fn emit(&self, event: ActionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn progress(&self, message: String) {
        tracing::info!("{}", message);
        self.emit(ActionEvent::Progress(message));
    }

    /// Consume one retry if the budget allows
    pub fn increment_retry(&self) -> bool {
        self.current_retry
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.retries).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn hold_device(&self, device: SharedTaskDevice) {
        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = Some(device);
    }

    pub fn release_device(&self) {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn has_device(&self) -> bool {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Prepare a fresh run: retry counter and error cleared, status back to Idle
    pub fn reset(&self) {
        self.current_retry.store(0, Ordering::SeqCst);
        *self.error_message.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_status(ActionStatus::Idle);
    }

    pub fn complete(&self) -> ActionStatus {
        self.release_device();
        if self.set_status(ActionStatus::Completed) {
            self.emit(ActionEvent::Completed);
        }
        self.status()
    }

    pub fn fail(&self, message: String) -> ActionStatus {
        self.release_device();
        if self.is_aborted() {
            return ActionStatus::Aborted;
        }
        tracing::warn!("Task action failed: {}", message);
        *self.error_message.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        self.set_status(ActionStatus::Failed);
        self.emit(ActionEvent::Failed(message));
        ActionStatus::Failed
    }

    pub fn replace_task(&self, handle: JoinHandle<()>) {
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn abort(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.release_device();
        self.set_status(ActionStatus::Aborted);
    }

    /// Wait for the current run to reach a terminal status
    pub async fn wait(&self) -> ActionStatus {
        let mut rx = self.status_tx.subscribe();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_coercion() {
        assert_eq!(value_as_f64(&json!(21.5)), Some(21.5));
        assert_eq!(value_as_f64(&json!(" -10 ")), Some(-10.0));
        assert_eq!(value_as_f64(&json!("warm")), None);

        assert!(value_as_bool(&json!(true)));
        assert!(value_as_bool(&json!("On")));
        assert!(value_as_bool(&json!(1)));
        assert!(!value_as_bool(&json!("false")));
        assert!(!value_as_bool(&json!("")));
        assert!(!value_as_bool(&json!(0)));

        assert_eq!(value_as_string(&json!("Ha")), "Ha");
        assert_eq!(value_as_string(&json!(3)), "3");
    }

    #[test]
    fn test_retry_budget() {
        let core = ActionCore::new(2);
        assert!(core.increment_retry());
        assert!(core.increment_retry());
        assert!(!core.increment_retry());
        assert_eq!(core.current_retry(), 2);

        core.reset();
        assert_eq!(core.current_retry(), 0);
        assert_eq!(core.status(), ActionStatus::Idle);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let core = std::sync::Arc::new(ActionCore::new(0));
        let mut events = core.subscribe();
        core.set_status(ActionStatus::Running);

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait().await })
        };
        core.fail("Property entered Alert state".to_string());

        assert_eq!(waiter.await.unwrap(), ActionStatus::Failed);
        assert_eq!(
            core.error_message().as_deref(),
            Some("Property entered Alert state")
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ActionEvent::StatusChanged(ActionStatus::Running)
        );
    }
}
