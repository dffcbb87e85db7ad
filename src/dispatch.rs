//! The orchestrator: accept a message, coalesce it, preload auth, enqueue
//! the run, and let the event bus carry completions back to the registry.
//!
//! The dispatcher owns no scheduling logic of its own; it only wires the
//! coalescer, auth cache, task queue, event bus, and subagent registry
//! together and applies the priority rules.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::{AuthCache, AuthResolver, ProfileStore, ResolvedAuth};
use crate::coalesce::MessageCoalescer;
use crate::error::{DispatchError, RunnerError, TaskError};
use crate::events::{AgentEvent, EventBus, LifecyclePhase};
use crate::message::{DispatchHints, ImageAttachment, InboundMessage};
use crate::queue::{Priority, SessionSubmitOptions, TaskQueue};
use crate::settings::Settings;
use crate::subagents::{
    AnnounceFlow, CleanupMode, RegisterSubagent, RunStore, SessionStore, SubagentRegistry,
};
use crate::timers::TimerRegistry;

/// Bounded retry for transient auth failures.
const AUTH_ATTEMPTS: usize = 3;
const AUTH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Input handed to an agent worker.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub session_key: String,
    pub text: String,
    pub images: Vec<ImageAttachment>,
    pub auth: ResolvedAuth,
}

/// Worker output surfaced to the transport caller.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub text: String,
    pub metadata: serde_json::Value,
}

impl RunOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// The agent worker collaborator. Implementations run the actual model
/// turn; the core only schedules them.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, req: RunRequest) -> Result<RunOutput, RunnerError>;
}

/// Parameters for spawning a subagent run.
#[derive(Debug, Clone)]
pub struct SpawnSubagent {
    pub requester_session_key: String,
    pub requester_display_key: Option<String>,
    pub requester_origin: serde_json::Value,
    pub task: String,
    pub cleanup: CleanupMode,
    pub label: Option<String>,
    /// Overrides `agents.defaults.subagents.runTimeoutSeconds`.
    pub run_timeout: Option<Duration>,
}

struct DispatcherInner {
    settings: Mutex<Settings>,
    timers: TimerRegistry,
    bus: EventBus,
    queue: TaskQueue,
    coalescer: MessageCoalescer,
    auth: AuthCache,
    subagents: SubagentRegistry,
    runner: Arc<dyn AgentRunner>,
}

/// Entry point wiring the core together. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn AgentRunner>,
        resolver: Arc<dyn AuthResolver>,
        profiles: Arc<dyn ProfileStore>,
        announcer: Arc<dyn AnnounceFlow>,
        sessions: Arc<dyn SessionStore>,
        run_store_path: PathBuf,
    ) -> Self {
        let timers = TimerRegistry::new();
        let bus = EventBus::new();

        let defaults = &settings.agents.defaults;
        let queue = TaskQueue::new(defaults.max_concurrent_sessions);
        queue.configure_lane("cron", settings.cron.max_concurrent_runs);

        let coalescer = MessageCoalescer::new(defaults.coalesce.clone(), timers.clone());
        let auth = AuthCache::new(resolver, profiles, defaults.auth_cache.clone());
        let archive_after = Some(Duration::from_secs(
            defaults.subagents.archive_after_minutes * 60,
        ));
        let subagents = SubagentRegistry::new(
            bus.clone(),
            timers.clone(),
            RunStore::new(run_store_path),
            announcer,
            sessions,
            archive_after,
        );

        Self {
            inner: Arc::new(DispatcherInner {
                settings: Mutex::new(settings),
                timers,
                bus,
                queue,
                coalescer,
                auth,
                subagents,
                runner,
            }),
        }
    }

    /// Restore persisted subagent state. Call once at startup.
    pub async fn init(&self) {
        self.inner.subagents.init().await;
    }

    /// Batch-preload credentials for every configured provider.
    pub async fn warm_auth(&self) {
        let settings = { self.inner.settings.lock().unwrap().clone() };
        self.inner.auth.warm_cache(&settings).await;
    }

    /// Apply a freshly-loaded settings document to the live components.
    pub fn apply_settings(&self, settings: Settings) {
        let defaults = &settings.agents.defaults;
        self.inner
            .queue
            .set_max_concurrent_sessions(defaults.max_concurrent_sessions);
        self.inner
            .queue
            .configure_lane("cron", settings.cron.max_concurrent_runs);
        self.inner.coalescer.configure(defaults.coalesce.clone());
        *self.inner.settings.lock().unwrap() = settings;
    }

    /// Handle one inbound message end to end.
    ///
    /// Returns `Ok(None)` when the message joined an existing coalesce
    /// window: another in-flight call owns that batch and will dispatch
    /// it. The owning call resolves with the worker's output.
    pub async fn handle_message(
        &self,
        msg: InboundMessage,
    ) -> Result<Option<RunOutput>, DispatchError> {
        let session_key = msg.session_key.clone();
        let hints = msg.hints.clone();

        let batch = self.inner.coalescer.coalesce_entry(&session_key, msg).await;
        if !batch.dispatches() || batch.messages.is_empty() {
            return Ok(None);
        }
        let combined = self.inner.coalescer.combine(&batch.messages);

        let provider = hints.provider.clone().unwrap_or_else(|| {
            self.inner
                .settings
                .lock()
                .unwrap()
                .agents
                .defaults
                .provider
                .clone()
        });
        let auth = self
            .resolve_auth(&provider, hints.profile.as_deref())
            .await
            .ok_or_else(|| DispatchError::AuthUnavailable {
                provider: provider.clone(),
            })?;

        // The most urgent message in the batch decides the priority.
        let priority = batch
            .messages
            .iter()
            .map(|m| resolve_priority(&m.hints))
            .min()
            .unwrap_or_default();

        let request = RunRequest {
            run_id: Uuid::new_v4().to_string(),
            session_key: session_key.clone(),
            text: combined.text,
            images: combined.images,
            auth,
        };
        let runner = Arc::clone(&self.inner.runner);
        let auth_cache = self.inner.auth.clone();
        let profile = hints.profile.clone();

        let output = self
            .inner
            .queue
            .submit_session(
                SessionSubmitOptions::new(session_key).with_priority(priority),
                move || async move {
                    match runner.run(request).await {
                        Ok(output) => Ok(output),
                        Err(RunnerError::Unauthorized { provider }) => {
                            auth_cache.invalidate(&provider, profile.as_deref()).await;
                            Err(TaskError::failed(format!(
                                "provider {provider} rejected the credential"
                            )))
                        }
                        Err(err) => Err(TaskError::failed(err)),
                    }
                },
            )
            .await?;
        Ok(Some(output))
    }

    /// Register and launch a subagent run for a requester session.
    ///
    /// Returns the run id immediately; completion flows through the event
    /// bus to the registry (use `subagents().wait_for_run` to block on it).
    pub fn spawn_subagent(&self, params: SpawnSubagent) -> String {
        let run_id = Uuid::new_v4().to_string();
        let child_session_key = format!("subagent:{run_id}");

        self.inner.subagents.register(RegisterSubagent {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
            requester_session_key: params.requester_session_key,
            requester_display_key: params.requester_display_key,
            requester_origin: params.requester_origin,
            task: params.task.clone(),
            cleanup: params.cleanup,
            label: params.label,
        });

        let (provider, default_timeout) = {
            let settings = self.inner.settings.lock().unwrap();
            (
                settings.agents.defaults.provider.clone(),
                settings
                    .agents
                    .defaults
                    .subagents
                    .run_timeout_seconds
                    .map(Duration::from_secs),
            )
        };
        let run_timeout = params.run_timeout.or(default_timeout);

        let bus = self.inner.bus.clone();
        let auth_cache = self.inner.auth.clone();
        let runner = Arc::clone(&self.inner.runner);
        let task_text = params.task;
        let worker_run_id = run_id.clone();

        let submitted = self.inner.queue.submit_session(
            SessionSubmitOptions::new(child_session_key.clone()),
            move || async move {
                bus.emit(
                    &AgentEvent::lifecycle(worker_run_id.clone(), LifecyclePhase::Start)
                        .with_session(child_session_key.clone()),
                );

                let Some(auth) = auth_cache.find_available(&provider, None).await else {
                    bus.emit(
                        &AgentEvent::lifecycle(worker_run_id.clone(), LifecyclePhase::Error)
                            .with_session(child_session_key.clone())
                            .with_data(serde_json::json!({ "error": "no auth available" })),
                    );
                    return Err(TaskError::failed("no auth available"));
                };

                let request = RunRequest {
                    run_id: worker_run_id.clone(),
                    session_key: child_session_key.clone(),
                    text: task_text,
                    images: Vec::new(),
                    auth,
                };
                let result = match run_timeout {
                    Some(limit) => match tokio::time::timeout(limit, runner.run(request)).await {
                        Ok(result) => result,
                        Err(_) => {
                            bus.emit(
                                &AgentEvent::lifecycle(
                                    worker_run_id.clone(),
                                    LifecyclePhase::End,
                                )
                                .with_session(child_session_key.clone())
                                .with_data(serde_json::json!({ "aborted": true })),
                            );
                            return Err(TaskError::failed("subagent run timed out"));
                        }
                    },
                    None => runner.run(request).await,
                };

                match result {
                    Ok(output) => {
                        bus.emit(
                            &AgentEvent::lifecycle(worker_run_id.clone(), LifecyclePhase::End)
                                .with_session(child_session_key.clone()),
                        );
                        Ok(output)
                    }
                    Err(err) => {
                        bus.emit(
                            &AgentEvent::lifecycle(worker_run_id.clone(), LifecyclePhase::Error)
                                .with_session(child_session_key.clone())
                                .with_data(serde_json::json!({ "error": err.to_string() })),
                        );
                        Err(TaskError::failed(err))
                    }
                }
            },
        );
        // The queue drives the task; completion is observed via the bus.
        drop(submitted);

        run_id
    }

    /// Drain named-lane work and stop all timers; the quiesce step of a
    /// graceful shutdown.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let report = self.inner.queue.wait_for_active_tasks(drain_timeout).await;
        self.inner.coalescer.clear_all();
        self.inner.timers.clear_all();
        self.inner.subagents.flush_store().await;
        report.drained
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn coalescer(&self) -> &MessageCoalescer {
        &self.inner.coalescer
    }

    pub fn auth(&self) -> &AuthCache {
        &self.inner.auth
    }

    pub fn subagents(&self) -> &SubagentRegistry {
        &self.inner.subagents
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.inner.timers
    }

    async fn resolve_auth(&self, provider: &str, profile: Option<&str>) -> Option<ResolvedAuth> {
        for attempt in 0..AUTH_ATTEMPTS {
            if let Some(auth) = self.inner.auth.find_available(provider, profile).await {
                return Some(auth);
            }
            if attempt + 1 < AUTH_ATTEMPTS {
                tracing::debug!(provider, attempt, "auth unavailable, retrying");
                tokio::time::sleep(AUTH_RETRY_DELAY).await;
            }
        }
        None
    }
}

/// Priority rules: explicit hint wins, then urgency flags, then the
/// background-ish sources, then normal.
fn resolve_priority(hints: &DispatchHints) -> Priority {
    if let Some(priority) = hints.priority {
        return priority;
    }
    if hints.mention || hints.reply || hints.urgent {
        Priority::Urgent
    } else if hints.heartbeat || hints.cron {
        Priority::Background
    } else {
        Priority::Normal
    }
}
