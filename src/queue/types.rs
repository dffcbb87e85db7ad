//! Public types for the task queue.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling priority. Lower numeric value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
    Background = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Callback invoked at dequeue time when a task waited at least
/// `warn_after`; receives the wait duration and how many entries are still
/// queued behind it.
pub type WaitCallback = Box<dyn FnOnce(Duration, usize) + Send>;

/// Options for a named-lane submission.
pub struct SubmitOptions {
    pub priority: Priority,
    pub warn_after: Duration,
    pub on_wait: Option<WaitCallback>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            warn_after: Duration::from_secs(10),
            on_wait: None,
        }
    }
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = warn_after;
        self
    }

    pub fn with_on_wait(mut self, on_wait: impl FnOnce(Duration, usize) + Send + 'static) -> Self {
        self.on_wait = Some(Box::new(on_wait));
        self
    }
}

/// Options for a session-lane submission.
pub struct SessionSubmitOptions {
    pub session_key: String,
    pub priority: Priority,
    pub warn_after: Duration,
    pub on_wait: Option<WaitCallback>,
}

impl SessionSubmitOptions {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            priority: Priority::Normal,
            warn_after: Duration::from_secs(10),
            on_wait: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = warn_after;
        self
    }

    pub fn with_on_wait(mut self, on_wait: impl FnOnce(Duration, usize) + Send + 'static) -> Self {
        self.on_wait = Some(Box::new(on_wait));
        self
    }
}

/// Per-lane counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneStats {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

/// Aggregate counters over all session lanes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

/// Queued-entry counts per priority, across named and session lanes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityCounts {
    pub urgent: usize,
    pub normal: usize,
    pub background: usize,
}

impl PriorityCounts {
    pub(crate) fn bump(&mut self, priority: Priority, by: usize) {
        match priority {
            Priority::Urgent => self.urgent += by,
            Priority::Normal => self.normal += by,
            Priority::Background => self.background += by,
        }
    }
}

/// Snapshot returned by `TaskQueue::queue_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub lanes: HashMap<String, LaneStats>,
    pub sessions: SessionStats,
    pub by_priority: PriorityCounts,
}

/// Result of a graceful drain.
#[derive(Debug, Clone, Copy)]
pub struct DrainReport {
    pub drained: bool,
}
