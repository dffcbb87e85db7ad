//! The subagent run registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::oneshot;

use crate::events::{AgentEvent, EventBus, LifecyclePhase, SubscriptionId};
use crate::subagents::{
    AnnounceFlow, AnnounceRequest, CleanupMode, DeleteSessionOptions, RunOutcome, RunStore,
    SessionStore, SubagentRun,
};
use crate::timers::{TimerId, TimerRegistry};

/// Ceiling on a single announce attempt.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(120);

const SWEEP_TIMER_LABEL: &str = "subagent-archive";

/// Parameters for registering a run.
#[derive(Debug, Clone)]
pub struct RegisterSubagent {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: Option<String>,
    pub requester_origin: serde_json::Value,
    pub task: String,
    pub cleanup: CleanupMode,
    pub label: Option<String>,
}

struct RegistryState {
    runs: HashMap<String, SubagentRun>,
    waiters: HashMap<String, Vec<oneshot::Sender<SubagentRun>>>,
    subscription: Option<SubscriptionId>,
    loaded: bool,
    sweep_timer: Option<TimerId>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    bus: EventBus,
    timers: TimerRegistry,
    store: RunStore,
    announcer: Arc<dyn AnnounceFlow>,
    sessions: Arc<dyn SessionStore>,
    /// Grace period between completion-eligibility and archival; None
    /// disables archival entirely.
    archive_after: Option<Duration>,
}

/// Event-driven registry of subagent runs. Cheap to clone.
#[derive(Clone)]
pub struct SubagentRegistry {
    inner: Arc<RegistryInner>,
}

impl SubagentRegistry {
    pub fn new(
        bus: EventBus,
        timers: TimerRegistry,
        store: RunStore,
        announcer: Arc<dyn AnnounceFlow>,
        sessions: Arc<dyn SessionStore>,
        archive_after: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    runs: HashMap::new(),
                    waiters: HashMap::new(),
                    subscription: None,
                    loaded: false,
                    sweep_timer: None,
                }),
                bus,
                timers,
                store,
                announcer,
                sessions,
                archive_after,
            }),
        }
    }

    /// Track a new run. The record starts in the created/started phase and
    /// is persisted immediately; the bus subscription picks up its
    /// lifecycle events from here on.
    pub fn register(&self, params: RegisterSubagent) -> SubagentRun {
        self.ensure_subscribed();

        let now = Utc::now();
        let archive_at = self
            .inner
            .archive_after
            .and_then(|after| TimeDelta::from_std(after).ok())
            .map(|after| now + after);
        let run = SubagentRun {
            run_id: params.run_id,
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_display_key: params.requester_display_key,
            requester_origin: params.requester_origin,
            task: params.task,
            cleanup: params.cleanup,
            label: params.label,
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            outcome: None,
            archive_at,
            cleanup_handled: false,
            cleanup_completed_at: None,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.runs.insert(run.run_id.clone(), run.clone());
            self.reschedule_sweep_locked(&mut state);
        }
        self.persist();
        tracing::info!(
            run_id = %run.run_id,
            requester = %run.requester_session_key,
            "registered subagent run"
        );
        run
    }

    /// Wait until the run ends or the deadline passes.
    ///
    /// Resolves with the completed record, with it immediately if the run
    /// already ended, with None for an unknown run or on timeout. Any
    /// number of concurrent waiters is fine; all get the same record.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Option<SubagentRun> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            match state.runs.get(run_id) {
                None => return None,
                Some(run) if run.ended() => return Some(run.clone()),
                Some(_) => {}
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(run_id.to_string()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(record)) => Some(record),
            // Sender dropped: the run was released or archived underneath us.
            Ok(Err(_)) => None,
            Err(_) => {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(waiters) = state.waiters.get_mut(run_id) {
                    waiters.retain(|tx| !tx.is_closed());
                    if waiters.is_empty() {
                        state.waiters.remove(run_id);
                    }
                }
                None
            }
        }
    }

    pub fn get_run(&self, run_id: &str) -> Option<SubagentRun> {
        self.inner.state.lock().unwrap().runs.get(run_id).cloned()
    }

    /// Runs for a requester that have not ended yet.
    pub fn active_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        self.inner
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|run| run.requester_session_key == requester_session_key && !run.ended())
            .cloned()
            .collect()
    }

    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        self.inner
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|run| run.requester_session_key == requester_session_key)
            .cloned()
            .collect()
    }

    /// Drop a run manually. Pending waiters resolve with None.
    pub fn release(&self, run_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            state.waiters.remove(run_id);
            let removed = state.runs.remove(run_id).is_some();
            if removed {
                self.reschedule_sweep_locked(&mut state);
            }
            removed
        };
        if removed {
            self.persist();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().unwrap().runs.len()
    }

    /// Restore persisted runs. Loads at most once per process; restored
    /// records merge newer-wins with anything registered before init ran.
    /// Runs that ended but were never cleaned re-enter the announce flow.
    pub async fn init(&self) {
        {
            let state = self.inner.state.lock().unwrap();
            if state.loaded {
                return;
            }
        }
        let restored = self.inner.store.load().await;

        let resumable: Vec<String> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.loaded {
                return;
            }
            state.loaded = true;

            for (run_id, mut run) in restored {
                // A crash mid-announce leaves the handled flag set with no
                // completion; clear it so the resume pass can retry.
                if run.ended() && run.cleanup_completed_at.is_none() {
                    run.cleanup_handled = false;
                }
                match state.runs.entry(run_id) {
                    Entry::Vacant(slot) => {
                        slot.insert(run);
                    }
                    Entry::Occupied(mut slot) => {
                        if run.created_at > slot.get().created_at {
                            slot.insert(run);
                        }
                    }
                }
            }

            state
                .runs
                .values()
                .filter(|run| run.ended() && run.cleanup_completed_at.is_none())
                .map(|run| run.run_id.clone())
                .collect()
        };

        self.ensure_subscribed();
        {
            let mut state = self.inner.state.lock().unwrap();
            self.reschedule_sweep_locked(&mut state);
        }
        self.persist();

        let total = self.count();
        tracing::info!(total, resuming = resumable.len(), "subagent registry initialized");
        for run_id in resumable {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.run_cleanup(run_id, false).await;
            });
        }
    }

    /// Flush queued persistence writes; for shutdown and tests.
    pub async fn flush_store(&self) {
        self.inner.store.flush().await;
    }

    fn ensure_subscribed(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.subscription.is_some() {
            return;
        }
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let id = self.inner.bus.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                SubagentRegistry { inner }.handle_event(event);
            }
        });
        state.subscription = Some(id);
    }

    fn handle_event(&self, event: &AgentEvent) {
        match event.lifecycle_phase() {
            Some(LifecyclePhase::Start) => self.on_start(event),
            Some(LifecyclePhase::End) => self.on_complete(event, false),
            Some(LifecyclePhase::Error) => self.on_complete(event, true),
            Some(LifecyclePhase::SubagentComplete) | None => {}
        }
    }

    fn on_start(&self, event: &AgentEvent) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            match state.runs.get_mut(&event.run_id) {
                Some(run) => {
                    run.started_at = Some(event.started_at().unwrap_or_else(Utc::now));
                    true
                }
                None => false,
            }
        };
        if changed {
            self.persist();
        }
    }

    fn on_complete(&self, event: &AgentEvent, errored: bool) {
        let completion = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(run) = state.runs.get_mut(&event.run_id) else {
                return;
            };
            if run.ended() {
                // endedAt is assigned exactly once; later events only get
                // another shot at cleanup.
                None
            } else {
                run.ended_at = Some(event.ended_at().unwrap_or_else(Utc::now));
                run.outcome = Some(if errored {
                    RunOutcome::Error {
                        message: event
                            .error_message()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    }
                } else if event.aborted() {
                    RunOutcome::Timeout
                } else {
                    RunOutcome::Ok
                });
                let record = run.clone();
                let waiters = state.waiters.remove(&event.run_id).unwrap_or_default();
                Some((record, waiters))
            }
        };

        if let Some((record, waiters)) = completion {
            self.persist();

            // Waiters wake synchronously, in registration order.
            for waiter in waiters {
                let _ = waiter.send(record.clone());
            }

            let outcome_tag = record.outcome.as_ref().map(RunOutcome::tag).unwrap_or("ok");
            tracing::info!(
                run_id = %record.run_id,
                outcome = outcome_tag,
                "subagent run completed"
            );
            self.inner.bus.emit(
                &AgentEvent::lifecycle(record.run_id.clone(), LifecyclePhase::SubagentComplete)
                    .with_session(record.requester_session_key.clone())
                    .with_data(serde_json::json!({
                        "label": record.label,
                        "task": record.task,
                        "outcome": outcome_tag,
                    })),
            );
        }

        let registry = self.clone();
        let run_id = event.run_id.clone();
        tokio::spawn(async move {
            registry.run_cleanup(run_id, true).await;
        });
    }

    /// Announce the outcome and apply the cleanup policy. `cleanup_handled`
    /// makes this exactly-once across concurrent completion and restart
    /// resume; an unannounced attempt resets the flag so a later wake
    /// retries.
    async fn run_cleanup(&self, run_id: String, wait_for_completion: bool) {
        let request = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(run) = state.runs.get_mut(&run_id) else {
                return;
            };
            if !run.ended() || run.cleanup_handled || run.cleanup_completed_at.is_some() {
                return;
            }
            run.cleanup_handled = true;
            AnnounceRequest {
                run: run.clone(),
                wait_for_completion,
            }
        };
        self.persist();

        let announced = match tokio::time::timeout(
            ANNOUNCE_TIMEOUT,
            self.inner.announcer.announce(request),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt.did_announce,
            Ok(Err(err)) => {
                tracing::warn!(run_id = %run_id, error = %err, "announce failed");
                false
            }
            Err(_) => {
                tracing::warn!(run_id = %run_id, "announce timed out");
                false
            }
        };

        if announced {
            {
                let mut state = self.inner.state.lock().unwrap();
                let Some(mode) = state.runs.get(&run_id).map(|run| run.cleanup) else {
                    return;
                };
                match mode {
                    CleanupMode::Delete => {
                        state.runs.remove(&run_id);
                        state.waiters.remove(&run_id);
                        self.reschedule_sweep_locked(&mut state);
                    }
                    CleanupMode::Keep => {
                        if let Some(run) = state.runs.get_mut(&run_id) {
                            run.cleanup_completed_at = Some(Utc::now());
                        }
                    }
                }
            }
            self.persist();
        } else {
            let reset = {
                let mut state = self.inner.state.lock().unwrap();
                match state.runs.get_mut(&run_id) {
                    Some(run) => {
                        run.cleanup_handled = false;
                        true
                    }
                    None => false,
                }
            };
            if reset {
                self.persist();
            }
        }
    }

    /// Re-arm the archive sweep at the earliest deadline, at least 1 s out.
    fn reschedule_sweep_locked(&self, state: &mut RegistryState) {
        if let Some(timer_id) = state.sweep_timer.take() {
            self.inner.timers.clear(&timer_id);
        }
        let Some(earliest) = state.runs.values().filter_map(|run| run.archive_at).min() else {
            return;
        };
        let delay = (earliest - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(1));

        let registry = self.clone();
        let timer_id = self
            .inner
            .timers
            .set_timeout(SWEEP_TIMER_LABEL, delay, move || async move {
                registry.sweep().await;
            });
        state.sweep_timer = Some(timer_id);
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let removed: Vec<SubagentRun> = {
            let mut state = self.inner.state.lock().unwrap();
            state.sweep_timer = None;
            let due: Vec<String> = state
                .runs
                .iter()
                .filter(|(_, run)| run.archive_at.map(|at| at <= now).unwrap_or(false))
                .map(|(run_id, _)| run_id.clone())
                .collect();
            let removed = due
                .into_iter()
                .filter_map(|run_id| {
                    state.waiters.remove(&run_id);
                    state.runs.remove(&run_id)
                })
                .collect();
            self.reschedule_sweep_locked(&mut state);
            removed
        };
        if removed.is_empty() {
            return;
        }

        tracing::info!(count = removed.len(), "archiving subagent runs");
        for run in &removed {
            if let Err(err) = self
                .inner
                .sessions
                .delete(
                    &run.child_session_key,
                    DeleteSessionOptions {
                        delete_transcript: true,
                    },
                )
                .await
            {
                tracing::warn!(
                    session = %run.child_session_key,
                    error = %err,
                    "failed to delete archived child session"
                );
            }
        }
        self.persist();
    }

    fn persist(&self) {
        let state = self.inner.state.lock().unwrap();
        self.inner.store.persist(&state.runs);
    }
}
