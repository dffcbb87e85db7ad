//! Process-wide fan-out of agent lifecycle events.
//!
//! The bus is the only channel between worker completion and the subagent
//! registry: the registry subscribes, the bus knows nothing about it.
//! Delivery is synchronous and best-effort; a panicking subscriber is
//! isolated and the remaining subscribers still see the event.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream tag for lifecycle events.
pub const LIFECYCLE_STREAM: &str = "lifecycle";

/// Phase of a run's lifecycle, carried in the event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    SubagentComplete,
}

/// An event emitted by a worker or by the core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Run this event belongs to.
    pub run_id: String,
    /// Stream tag; everything the core reacts to is on `lifecycle`.
    pub stream: String,
    /// Session the event targets, when there is one.
    pub session_key: Option<String>,
    /// Opaque payload. Lifecycle events carry `phase` plus phase-specific
    /// fields (`error`, `aborted`, `startedAt`, `endedAt`).
    pub data: serde_json::Value,
}

impl AgentEvent {
    /// Build a lifecycle event for a run.
    pub fn lifecycle(run_id: impl Into<String>, phase: LifecyclePhase) -> Self {
        Self {
            run_id: run_id.into(),
            stream: LIFECYCLE_STREAM.to_string(),
            session_key: None,
            data: serde_json::json!({ "phase": phase }),
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Merge extra fields into the payload object.
    pub fn with_data(mut self, fields: serde_json::Value) -> Self {
        if let (Some(data), Some(extra)) = (self.data.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                data.insert(k.clone(), v.clone());
            }
        }
        self
    }

    pub fn is_lifecycle(&self) -> bool {
        self.stream == LIFECYCLE_STREAM
    }

    /// Phase of a lifecycle event, if present and well-formed.
    pub fn lifecycle_phase(&self) -> Option<LifecyclePhase> {
        if !self.is_lifecycle() {
            return None;
        }
        self.data
            .get("phase")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether the worker reported the run as aborted (timed out).
    pub fn aborted(&self) -> bool {
        self.data
            .get("aborted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Error message carried by an `error` phase event.
    pub fn error_message(&self) -> Option<String> {
        self.data
            .get("error")
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn timestamp_field(&self, key: &str) -> Option<DateTime<Utc>> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Worker-reported start time, when the payload carries one.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_field("startedAt")
    }

    /// Worker-reported end time, when the payload carries one.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_field("endedAt")
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Synchronous fan-out bus keyed by subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<(SubscriptionId, Handler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run synchronously inside `emit`, in
    /// registration order.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver an event to every subscriber.
    ///
    /// The subscriber list is snapshotted first, so handlers may emit
    /// further events (re-entrancy) or subscribe/unsubscribe without
    /// deadlocking. A panicking handler is logged and skipped.
    pub fn emit(&self, event: &AgentEvent) {
        let handlers: Vec<(SubscriptionId, Handler)> =
            { self.subscribers.lock().unwrap().clone() };
        for (id, handler) in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(
                    subscription = id.0,
                    run_id = %event.run_id,
                    "event subscriber panicked"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
