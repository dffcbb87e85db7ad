//! Priority-aware task queue with named lanes and per-session lanes.
//!
//! Named lanes (`main`, `cron`, `subagent`, …) hold three FIFO buckets, one
//! per priority, and run up to `max_concurrent` tasks at once. Session lanes
//! serialize strictly within a session and share a global concurrency cap.
//! Tasks are opaque async callables; their results settle the caller's
//! future and never crash the pump.

mod scheduler;
mod types;

pub use scheduler::TaskQueue;
pub use types::{
    DrainReport, LaneStats, Priority, PriorityCounts, QueueStats, SessionStats,
    SessionSubmitOptions, SubmitOptions, WaitCallback,
};
