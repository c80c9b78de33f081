//! Unsolicited device events
//!
//! Messages that do not answer a pending command are classified by content
//! and fanned out to subscribers. Classification checks run in a fixed
//! priority order; the first match wins.

use crate::protocol::DeviceMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Kind of an unsolicited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProgressUpdate,
    StateChange,
    Error,
    ImageReady,
    OperationComplete,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ProgressUpdate,
        EventKind::StateChange,
        EventKind::Error,
        EventKind::ImageReady,
        EventKind::OperationComplete,
        EventKind::Unknown,
    ];

    fn index(self) -> usize {
        match self {
            EventKind::ProgressUpdate => 0,
            EventKind::StateChange => 1,
            EventKind::Error => 2,
            EventKind::ImageReady => 3,
            EventKind::OperationComplete => 4,
            EventKind::Unknown => 5,
        }
    }
}

/// An unsolicited message after classification
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    /// Method named by the message, if it carried one
    pub source_command: Option<String>,
}

impl DeviceEvent {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }
}

/// Classify a message that matched no pending command
pub fn classify(message: &DeviceMessage) -> DeviceEvent {
    let empty = Map::new();
    let result = message.result_object().unwrap_or(&empty);
    let field = |key: &str| result.get(key).cloned().unwrap_or(Value::Null);

    let (kind, data) = if result.contains_key("progress") || result.contains_key("percent") {
        (
            EventKind::ProgressUpdate,
            json!({
                "progress": result.get("progress").cloned().unwrap_or(json!(0)),
                "percent": result.get("percent").cloned().unwrap_or(json!(0)),
                "frame": result.get("frame").cloned().unwrap_or(json!(0)),
                "total_frames": result.get("total_frames").cloned().unwrap_or(json!(0)),
            }),
        )
    } else if result.contains_key("state") {
        (
            EventKind::StateChange,
            json!({ "state": field("state"), "stage": field("stage") }),
        )
    } else if message.has_error() || message.code() != 0 {
        (
            EventKind::Error,
            json!({
                "error": message.error_message().unwrap_or_else(|| "Unknown error".to_string()),
                "code": message.code(),
            }),
        )
    } else if result.contains_key("stacked") || result.contains_key("image_ready") {
        (
            EventKind::ImageReady,
            json!({ "filename": field("filename"), "path": field("path") }),
        )
    } else if result.get("stage").and_then(Value::as_str) == Some("Idle") || is_truthy(result.get("complete")) {
        (
            EventKind::OperationComplete,
            json!({
                "operation": field("operation"),
                "success": result.get("success").cloned().unwrap_or(json!(true)),
                "position": field("position"),
            }),
        )
    } else {
        (EventKind::Unknown, Value::Object(result.clone()))
    };

    DeviceEvent {
        kind,
        timestamp: Utc::now(),
        data,
        source_command: message.method().map(str::to_string),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Event callback
pub type EventCallback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Progress callback: `(percent, details)`
pub type ProgressCallback = Arc<dyn Fn(f64, &Value) + Send + Sync>;

/// Handle returned by the subscribe calls, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Slot<T> = Mutex<Vec<(SubscriptionId, T)>>;

/// Subscriber registry with one slot per event kind
pub struct EventDispatcher {
    next_id: AtomicU64,
    all: Slot<EventCallback>,
    by_kind: [Slot<EventCallback>; 6],
    progress: Slot<ProgressCallback>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            all: Mutex::new(Vec::new()),
            by_kind: Default::default(),
            progress: Mutex::new(Vec::new()),
        }
    }

    fn allocate(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a callback for one event kind
    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId {
        let id = self.allocate();
        lock(&self.by_kind[kind.index()]).push((id, callback));
        tracing::debug!("Subscribed to {:?} events", kind);
        id
    }

    /// Remove a kind-specific callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let removed = remove(&self.by_kind[kind.index()], id);
        if removed {
            tracing::debug!("Unsubscribed from {:?} events", kind);
        }
        removed
    }

    /// Register a callback for every event
    pub fn subscribe_all(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.allocate();
        lock(&self.all).push((id, callback));
        id
    }

    pub fn unsubscribe_all(&self, id: SubscriptionId) -> bool {
        remove(&self.all, id)
    }

    /// Register a progress-only callback receiving `(percent, details)`
    pub fn subscribe_progress(&self, callback: ProgressCallback) -> SubscriptionId {
        let id = self.allocate();
        lock(&self.progress).push((id, callback));
        id
    }

    pub fn unsubscribe_progress(&self, id: SubscriptionId) -> bool {
        remove(&self.progress, id)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.by_kind[kind.index()]).len()
    }

    /// Deliver an event: all-event callbacks, then kind callbacks, then the
    /// progress shortcut. A panicking callback is logged and skipped.
    pub fn dispatch(&self, event: &DeviceEvent) {
        // Snapshot each list so callbacks may (un)subscribe while running
        let all: Vec<EventCallback> = lock(&self.all).iter().map(|(_, cb)| cb.clone()).collect();
        for callback in all {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!("All-events callback panicked on {:?} event", event.kind);
            }
        }

        let specific: Vec<EventCallback> = lock(&self.by_kind[event.kind.index()])
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in specific {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!("{:?} callback panicked", event.kind);
            }
        }

        if event.kind == EventKind::ProgressUpdate {
            let percent = event.get_f64("percent").unwrap_or(0.0);
            let progress: Vec<ProgressCallback> =
                lock(&self.progress).iter().map(|(_, cb)| cb.clone()).collect();
            for callback in progress {
                if catch_unwind(AssertUnwindSafe(|| callback(percent, &event.data))).is_err() {
                    tracing::error!("Progress callback panicked");
                }
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove<T>(slot: &Slot<T>, id: SubscriptionId) -> bool {
    let mut list = lock(slot);
    let before = list.len();
    list.retain(|(sid, _)| *sid != id);
    list.len() != before
}

/// Unsubscribes its kind callback when dropped
pub(crate) struct SubscriptionGuard<'a> {
    dispatcher: &'a EventDispatcher,
    kind: EventKind,
    id: SubscriptionId,
}

impl<'a> SubscriptionGuard<'a> {
    pub fn new(dispatcher: &'a EventDispatcher, kind: EventKind, callback: EventCallback) -> Self {
        let id = dispatcher.subscribe(kind, callback);
        Self { dispatcher, kind, id }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.kind, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event_from(value: Value) -> DeviceEvent {
        classify(&DeviceMessage::new(value))
    }

    #[test]
    fn test_progress_wins_over_state() {
        let event = event_from(json!({
            "method": "Stack",
            "result": {"progress": 40, "percent": 40.0, "state": "working", "frame": 4}
        }));
        assert_eq!(event.kind, EventKind::ProgressUpdate);
        assert_eq!(event.get_u64("frame"), Some(4));
        assert_eq!(event.source_command.as_deref(), Some("Stack"));
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(
            event_from(json!({"result": {"state": "tracking", "stage": "AutoGoto"}})).kind,
            EventKind::StateChange
        );
        assert_eq!(
            event_from(json!({"error": "fail", "code": 207})).kind,
            EventKind::Error
        );
        assert_eq!(event_from(json!({"code": 109})).kind, EventKind::Error);
        // state outranks an error code
        assert_eq!(
            event_from(json!({"code": 109, "result": {"state": "fail"}})).kind,
            EventKind::StateChange
        );
        assert_eq!(
            event_from(json!({"result": {"stacked": true, "filename": "m31.fit"}})).kind,
            EventKind::ImageReady
        );
        assert_eq!(
            event_from(json!({"result": {"stage": "Idle"}})).kind,
            EventKind::OperationComplete
        );
        assert_eq!(
            event_from(json!({"result": {"complete": true, "operation": "auto_focus"}})).kind,
            EventKind::OperationComplete
        );
        assert_eq!(
            event_from(json!({"result": {"complete": false}})).kind,
            EventKind::Unknown
        );
        assert_eq!(event_from(json!({"Event": "PiStatus"})).kind, EventKind::Unknown);
    }

    #[test]
    fn test_error_payload() {
        let event = event_from(json!({"error": "fail to operate", "code": 207}));
        assert_eq!(event.get_str("error"), Some("fail to operate"));
        assert_eq!(event.get_u64("code"), Some(207));
    }

    #[test]
    fn test_dispatch_order_and_progress_shortcut() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        dispatcher.subscribe(
            EventKind::ProgressUpdate,
            Arc::new(move |_: &DeviceEvent| o.lock().unwrap().push("kind")),
        );
        let o = order.clone();
        dispatcher.subscribe_progress(Arc::new(move |percent: f64, _: &Value| {
            assert!((percent - 55.0).abs() < 1e-9);
            o.lock().unwrap().push("progress");
        }));
        let o = order.clone();
        dispatcher.subscribe_all(Arc::new(move |_: &DeviceEvent| o.lock().unwrap().push("all")));

        dispatcher.dispatch(&event_from(json!({"result": {"percent": 55.0}})));
        assert_eq!(*order.lock().unwrap(), vec!["all", "kind", "progress"]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe(EventKind::StateChange, Arc::new(|_: &DeviceEvent| panic!("boom")));
        let h = hits.clone();
        dispatcher.subscribe(
            EventKind::StateChange,
            Arc::new(move |_: &DeviceEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let event = event_from(json!({"result": {"state": "tracking"}}));
        dispatcher.dispatch(&event);
        dispatcher.dispatch(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_and_guard() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = dispatcher.subscribe(
            EventKind::Error,
            Arc::new(move |_: &DeviceEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(dispatcher.unsubscribe(EventKind::Error, id));
        assert!(!dispatcher.unsubscribe(EventKind::Error, id));
        dispatcher.dispatch(&event_from(json!({"error": "x"})));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        {
            let _guard = SubscriptionGuard::new(&dispatcher, EventKind::Error, Arc::new(|_: &DeviceEvent| {}));
            assert_eq!(dispatcher.subscriber_count(EventKind::Error), 1);
        }
        assert_eq!(dispatcher.subscriber_count(EventKind::Error), 0);
    }
}
