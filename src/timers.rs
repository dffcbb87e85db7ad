//! Tracked timers with labels and deterministic shutdown.
//!
//! Every deferred callback in the core (coalesce windows, archive sweeps,
//! cache refreshes) goes through this registry so that shutdown can cancel
//! all of them in one call and tests can assert nothing is left ticking.
//!
//! Callback panics are caught and logged; they never reach the scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;

/// Synthetic timer id: `"{label}#{counter}"`.
pub type TimerId = String;

/// Kind of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

struct TimerEntry {
    kind: TimerKind,
    label: String,
    period: Duration,
    created_at: DateTime<Utc>,
    /// Set right after spawn. `None` only in the window between registering
    /// the entry and storing the handle, or when a zero-delay timeout fired
    /// before the handle landed.
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TimerState {
    timers: HashMap<TimerId, TimerEntry>,
    counter: u64,
}

/// Registry of all live timers. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    state: Arc<Mutex<TimerState>>,
}

/// Snapshot of one registered timer, for introspection.
#[derive(Debug, Clone)]
pub struct TimerInfo {
    pub id: TimerId,
    pub kind: TimerKind,
    pub label: String,
    pub period: Duration,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    pub total: usize,
    pub timeouts: usize,
    pub intervals: usize,
    pub by_label: HashMap<String, usize>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot callback after `delay`.
    ///
    /// The entry is removed from the registry before the callback runs, so
    /// a firing timeout never appears in `list()` mid-callback. Clearing
    /// the id before the delay elapses suppresses the callback entirely.
    pub fn set_timeout<F, Fut>(&self, label: &str, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.register(TimerKind::Timeout, label, delay);
        let state = Arc::clone(&self.state);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let registered = {
                let mut state = state.lock().unwrap();
                state.timers.remove(&timer_id).is_some()
            };
            if !registered {
                return;
            }
            let guarded = AssertUnwindSafe(async move { callback().await });
            if guarded.catch_unwind().await.is_err() {
                tracing::error!(timer = %timer_id, "timer callback panicked");
            }
        });
        self.store_handle(&id, handle);
        id
    }

    /// Schedule a repeating callback every `period`.
    ///
    /// The interval stays registered until cleared. A panicking tick is
    /// logged and the interval keeps running.
    pub fn set_interval<F, Fut>(&self, label: &str, period: Duration, mut callback: F) -> TimerId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.register(TimerKind::Interval, label, period);
        let state = Arc::clone(&self.state);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            // The first tick of tokio's interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let registered = { state.lock().unwrap().timers.contains_key(&timer_id) };
                if !registered {
                    break;
                }
                let guarded = AssertUnwindSafe(async { callback().await });
                if guarded.catch_unwind().await.is_err() {
                    tracing::error!(timer = %timer_id, "interval callback panicked");
                }
            }
        });
        self.store_handle(&id, handle);
        id
    }

    /// Cancel a timer. Returns false for an unknown id.
    pub fn clear(&self, id: &TimerId) -> bool {
        let entry = { self.state.lock().unwrap().timers.remove(id) };
        match entry {
            Some(entry) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                true
            }
            None => {
                tracing::debug!(timer = %id, "clear of unregistered timer");
                false
            }
        }
    }

    /// Cancel every registered timer. Idempotent; returns the count cleared.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<TimerEntry> = {
            let mut state = self.state.lock().unwrap();
            state.timers.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
        if count > 0 {
            tracing::info!(count, "cleared all timers");
        }
        count
    }

    /// Cancel every timer whose label contains `pattern`. Returns the count.
    pub fn clear_matching(&self, pattern: &str) -> usize {
        let drained: Vec<TimerEntry> = {
            let mut state = self.state.lock().unwrap();
            let ids: Vec<TimerId> = state
                .timers
                .iter()
                .filter(|(_, e)| e.label.contains(pattern))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.timers.remove(&id))
                .collect()
        };
        let count = drained.len();
        for entry in drained {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
        count
    }

    /// Snapshot of all registered timers.
    pub fn list(&self) -> Vec<TimerInfo> {
        let state = self.state.lock().unwrap();
        state
            .timers
            .iter()
            .map(|(id, e)| TimerInfo {
                id: id.clone(),
                kind: e.kind,
                label: e.label.clone(),
                period: e.period,
                created_at: e.created_at,
            })
            .collect()
    }

    pub fn stats(&self) -> TimerStats {
        let state = self.state.lock().unwrap();
        let mut stats = TimerStats {
            total: state.timers.len(),
            ..Default::default()
        };
        for entry in state.timers.values() {
            match entry.kind {
                TimerKind::Timeout => stats.timeouts += 1,
                TimerKind::Interval => stats.intervals += 1,
            }
            *stats.by_label.entry(entry.label.clone()).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, kind: TimerKind, label: &str, period: Duration) -> TimerId {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("{}#{}", label, state.counter);
        state.timers.insert(
            id.clone(),
            TimerEntry {
                kind,
                label: label.to_string(),
                period,
                created_at: Utc::now(),
                handle: None,
            },
        );
        id
    }

    fn store_handle(&self, id: &TimerId, handle: JoinHandle<()>) {
        let mut state = self.state.lock().unwrap();
        match state.timers.get_mut(id) {
            Some(entry) => entry.handle = Some(handle),
            // Already fired (zero delay) or cleared; the task is done or
            // about to observe the missing entry and bail.
            None => drop(handle),
        }
    }
}
