//! Runtime scheduling and coordination core for a multi-channel AI-agent
//! gateway.
//!
//! The gateway around this crate handles transports, prompts, and tools;
//! this crate decides when each unit of work runs, in what order, with
//! what auth, and how completions propagate:
//!
//! - [`queue`] — named lanes and per-session lanes with priority buckets
//!   and a global session cap.
//! - [`auth`] — LRU + TTL credential preloading with background refresh
//!   and cooldown-aware failover.
//! - [`coalesce`] — per-session windows batching rapid-fire messages into
//!   single runs.
//! - [`subagents`] — parent-tracked child runs with event-driven
//!   completion, persistence, and archival.
//! - [`events`] — the synchronous lifecycle bus connecting workers to the
//!   registry.
//! - [`timers`] — tracked timers so shutdown can cancel all deferred work.
//! - [`dispatch`] — the orchestrator wiring the pieces together.
//!
//! Components are plain cloneable handles over shared state; hosts build a
//! [`dispatch::Dispatcher`] (or individual components) per process, tests
//! build fresh ones per case.

pub mod auth;
pub mod coalesce;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod message;
pub mod queue;
pub mod settings;
pub mod subagents;
pub mod timers;

pub use auth::{AuthCache, AuthResolver, PreloadRequest, ProfileStore, ResolvedAuth};
pub use coalesce::MessageCoalescer;
pub use dispatch::{AgentRunner, Dispatcher, RunOutput, RunRequest, SpawnSubagent};
pub use error::{AuthError, DispatchError, RunnerError, SettingsError, TaskError};
pub use events::{AgentEvent, EventBus, LifecyclePhase};
pub use message::{CombinedMessage, DispatchHints, ImageAttachment, InboundMessage};
pub use queue::{Priority, QueueStats, SessionSubmitOptions, SubmitOptions, TaskQueue};
pub use settings::Settings;
pub use subagents::{
    AnnounceFlow, CleanupMode, RegisterSubagent, RunOutcome, SessionStore, SubagentRegistry,
    SubagentRun,
};
pub use timers::TimerRegistry;
