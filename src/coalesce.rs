//! Per-session sliding windows that batch rapid-fire messages into a
//! single agent run.
//!
//! A window opens on the first message for a session and closes when it
//! ages out, fills up, or is flushed. Every caller that contributed to a
//! window resolves with the same accumulated list; the window is removed
//! from the map before anyone is woken so a late message starts a fresh
//! window instead of appending to a closing one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::message::{CombinedMessage, InboundMessage};
use crate::settings::CoalesceSettings;
use crate::timers::{TimerId, TimerRegistry};

/// How a `coalesce_entry` call related to its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRole {
    /// This call opened the window (or closed it by filling it at size 1).
    Opened,
    /// This call joined a window another call opened.
    Joined,
    /// Coalescing was disabled or the session key is excluded.
    Bypassed,
}

/// A resolved batch plus the caller's role in it.
#[derive(Debug)]
pub struct Batch {
    pub messages: Vec<InboundMessage>,
    pub role: BatchRole,
}

impl Batch {
    /// Whether this caller should dispatch the batch. Joiners resolve with
    /// the list for observability but must not double-dispatch.
    pub fn dispatches(&self) -> bool {
        !matches!(self.role, BatchRole::Joined)
    }
}

struct Window {
    generation: u64,
    messages: Vec<InboundMessage>,
    started_at: Instant,
    timer_id: Option<TimerId>,
    waiters: Vec<oneshot::Sender<Vec<InboundMessage>>>,
}

struct CoalesceState {
    config: CoalesceSettings,
    excludes: Vec<Regex>,
    windows: HashMap<String, Window>,
    next_generation: u64,
}

impl CoalesceState {
    fn is_excluded(&self, session_key: &str) -> bool {
        session_key.contains("subagent:")
            || self.excludes.iter().any(|re| re.is_match(session_key))
    }
}

/// Aggregate counters over active windows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoalesceStats {
    pub active_windows: usize,
    pub pending_messages: usize,
}

/// The coalescer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageCoalescer {
    state: Arc<Mutex<CoalesceState>>,
    timers: TimerRegistry,
}

enum EntryOutcome {
    Immediate(Vec<InboundMessage>),
    Wait(oneshot::Receiver<Vec<InboundMessage>>, BatchRole),
}

impl MessageCoalescer {
    pub fn new(config: CoalesceSettings, timers: TimerRegistry) -> Self {
        let excludes = compile_excludes(&config.exclude_patterns);
        Self {
            state: Arc::new(Mutex::new(CoalesceState {
                config,
                excludes,
                windows: HashMap::new(),
                next_generation: 0,
            })),
            timers,
        }
    }

    /// Replace the live configuration. Existing windows keep their
    /// already-armed deadlines; new windows use the new values.
    pub fn configure(&self, config: CoalesceSettings) {
        let excludes = compile_excludes(&config.exclude_patterns);
        let mut state = self.state.lock().unwrap();
        state.config = config;
        state.excludes = excludes;
    }

    /// Add a message to the session's window and resolve with the full
    /// batch once the window closes.
    pub async fn coalesce(&self, session_key: &str, msg: InboundMessage) -> Vec<InboundMessage> {
        self.coalesce_entry(session_key, msg).await.messages
    }

    /// Like [`coalesce`](Self::coalesce), additionally reporting whether
    /// this call opened the window; the dispatcher uses the role to
    /// dispatch each batch exactly once.
    pub fn coalesce_entry(
        &self,
        session_key: &str,
        msg: InboundMessage,
    ) -> impl Future<Output = Batch> + Send {
        let mut closed: Option<Window> = None;
        let mut arm: Option<(u64, Duration)> = None;

        let outcome = {
            let mut state = self.state.lock().unwrap();
            let max_messages = state.config.max_messages;
            if !state.config.enabled || state.is_excluded(session_key) {
                EntryOutcome::Immediate(vec![msg])
            } else if let Some(window) = state.windows.get_mut(session_key) {
                window.messages.push(msg);
                let (tx, rx) = oneshot::channel();
                window.waiters.push(tx);
                let full = window.messages.len() >= max_messages;
                if full {
                    closed = state.windows.remove(session_key);
                }
                EntryOutcome::Wait(rx, BatchRole::Joined)
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                let (tx, rx) = oneshot::channel();
                state.windows.insert(
                    session_key.to_string(),
                    Window {
                        generation,
                        messages: vec![msg],
                        started_at: Instant::now(),
                        timer_id: None,
                        waiters: vec![tx],
                    },
                );
                if state.config.max_messages <= 1 {
                    closed = state.windows.remove(session_key);
                } else {
                    let window_ms = state.config.clamped_window_ms();
                    arm = Some((generation, Duration::from_millis(window_ms)));
                }
                EntryOutcome::Wait(rx, BatchRole::Opened)
            }
        };

        if let Some(window) = closed {
            self.finish(window);
        }
        if let Some((generation, delay)) = arm {
            self.arm_timer(session_key.to_string(), generation, delay);
        }

        async move {
            match outcome {
                EntryOutcome::Immediate(messages) => Batch {
                    messages,
                    role: BatchRole::Bypassed,
                },
                EntryOutcome::Wait(rx, role) => Batch {
                    messages: rx.await.unwrap_or_default(),
                    role,
                },
            }
        }
    }

    /// Fold a batch into one worker input. Single messages pass through
    /// untouched; multiples join trimmed texts with a blank line and
    /// concatenate image lists in order.
    pub fn combine(&self, messages: &[InboundMessage]) -> CombinedMessage {
        match messages {
            [] => CombinedMessage::default(),
            [single] => CombinedMessage {
                text: single.text.clone(),
                images: single.images.clone(),
            },
            _ => CombinedMessage {
                text: messages
                    .iter()
                    .map(|m| m.text.trim())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                images: messages.iter().flat_map(|m| m.images.clone()).collect(),
            },
        }
    }

    /// Force-close the session's window, if any. Waiters resolve with what
    /// accumulated so far.
    pub fn flush(&self, session_key: &str) -> bool {
        let window = { self.state.lock().unwrap().windows.remove(session_key) };
        match window {
            Some(window) => {
                self.finish(window);
                true
            }
            None => false,
        }
    }

    /// Force-close every window. Returns how many were flushed.
    pub fn clear_all(&self) -> usize {
        let windows: Vec<Window> = {
            let mut state = self.state.lock().unwrap();
            state.windows.drain().map(|(_, w)| w).collect()
        };
        let count = windows.len();
        for window in windows {
            self.finish(window);
        }
        count
    }

    pub fn has_active(&self, session_key: &str) -> bool {
        self.state.lock().unwrap().windows.contains_key(session_key)
    }

    pub fn pending_count(&self, session_key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .windows
            .get(session_key)
            .map(|w| w.messages.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CoalesceStats {
        let state = self.state.lock().unwrap();
        CoalesceStats {
            active_windows: state.windows.len(),
            pending_messages: state.windows.values().map(|w| w.messages.len()).sum(),
        }
    }

    fn arm_timer(&self, session_key: String, generation: u64, delay: Duration) {
        let coalescer = self.clone();
        let timer_key = session_key.clone();
        let timer_id = self.timers.set_timeout(
            &format!("coalesce:{session_key}"),
            delay,
            move || async move {
                coalescer.close_generation(&timer_key, generation);
            },
        );

        let mut state = self.state.lock().unwrap();
        match state.windows.get_mut(&session_key) {
            Some(window) if window.generation == generation => {
                window.timer_id = Some(timer_id);
            }
            // The window already closed (or was replaced) while we were
            // arming; the timer must not linger.
            _ => {
                drop(state);
                self.timers.clear(&timer_id);
            }
        }
    }

    fn close_generation(&self, session_key: &str, generation: u64) {
        let window = {
            let mut state = self.state.lock().unwrap();
            match state.windows.get(session_key) {
                Some(window) if window.generation == generation => {
                    state.windows.remove(session_key)
                }
                _ => None,
            }
        };
        if let Some(window) = window {
            self.finish(window);
        }
    }

    /// Fulfill a window that has been removed from the map.
    fn finish(&self, window: Window) {
        if let Some(timer_id) = &window.timer_id {
            self.timers.clear(timer_id);
        }
        tracing::debug!(
            count = window.messages.len(),
            age_ms = window.started_at.elapsed().as_millis() as u64,
            "coalesce window closed"
        );
        for waiter in window.waiters {
            let _ = waiter.send(window.messages.clone());
        }
    }
}

fn compile_excludes(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern = %pattern, error = %err, "bad exclude pattern, skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coalescer(window_ms: u64, max_messages: usize) -> MessageCoalescer {
        MessageCoalescer::new(
            CoalesceSettings {
                enabled: true,
                window_ms,
                max_messages,
                exclude_patterns: Vec::new(),
            },
            TimerRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_window_closes_on_timer_with_accumulated_messages() {
        let coalescer = coalescer(40, 10);

        let first = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "b"));

        let (first, second) = tokio::join!(first, second);
        let texts: Vec<&str> = first.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(second.messages.len(), 2);
        assert_eq!(first.role, BatchRole::Opened);
        assert_eq!(second.role, BatchRole::Joined);
        assert!(!coalescer.has_active("user-1"));
    }

    #[tokio::test]
    async fn test_window_closes_on_timer_with_single_message() {
        let coalescer = coalescer(20, 10);
        let batch = coalescer.coalesce("user-1", InboundMessage::new("user-1", "solo")).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "solo");
    }

    #[tokio::test]
    async fn test_max_messages_closes_immediately() {
        let coalescer = coalescer(5_000, 3);

        let a = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "1"));
        let b = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "2"));
        let c = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "3"));

        // The third submit hit the cap; nobody waits for the 5 s timer.
        let started = Instant::now();
        let (a, b, c) = tokio::join!(a, b, c);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(a.messages.len(), 3);
        assert_eq!(b.messages.len(), 3);
        assert_eq!(c.messages.len(), 3);
        assert!(!coalescer.has_active("user-1"));
    }

    #[tokio::test]
    async fn test_max_messages_of_one_bypasses_window_wait() {
        let coalescer = coalescer(5_000, 1);
        let started = Instant::now();
        let batch = coalescer
            .coalesce_entry("user-1", InboundMessage::new("user-1", "only"))
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.role, BatchRole::Opened);
    }

    #[tokio::test]
    async fn test_disabled_returns_singleton() {
        let coalescer = MessageCoalescer::new(
            CoalesceSettings {
                enabled: false,
                ..Default::default()
            },
            TimerRegistry::new(),
        );
        let batch = coalescer
            .coalesce_entry("user-1", InboundMessage::new("user-1", "x"))
            .await;
        assert_eq!(batch.role, BatchRole::Bypassed);
        assert_eq!(batch.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_subagent_sessions_bypass() {
        let coalescer = coalescer(5_000, 10);
        let batch = coalescer
            .coalesce_entry(
                "subagent:abc123",
                InboundMessage::new("subagent:abc123", "child work"),
            )
            .await;
        assert_eq!(batch.role, BatchRole::Bypassed);
        assert!(!coalescer.has_active("subagent:abc123"));
    }

    #[tokio::test]
    async fn test_exclude_pattern_bypasses() {
        let coalescer = MessageCoalescer::new(
            CoalesceSettings {
                exclude_patterns: vec!["^cron:".to_string()],
                ..Default::default()
            },
            TimerRegistry::new(),
        );
        let batch = coalescer
            .coalesce_entry("cron:daily", InboundMessage::new("cron:daily", "tick"))
            .await;
        assert_eq!(batch.role, BatchRole::Bypassed);
    }

    #[tokio::test]
    async fn test_flush_closes_early() {
        let coalescer = coalescer(5_000, 10);
        let pending = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "a"));

        assert!(coalescer.has_active("user-1"));
        assert_eq!(coalescer.pending_count("user-1"), 1);
        assert!(coalescer.flush("user-1"));
        assert!(!coalescer.flush("user-1"));

        let batch = pending.await;
        assert_eq!(batch.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_all_resolves_every_waiter() {
        let coalescer = coalescer(5_000, 10);
        let a = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "a"));
        let b = coalescer.coalesce_entry("user-2", InboundMessage::new("user-2", "b"));

        assert_eq!(coalescer.clear_all(), 2);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.messages.len(), 1);
        assert_eq!(b.messages.len(), 1);
        assert_eq!(coalescer.stats().active_windows, 0);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_windows() {
        let coalescer = coalescer(30, 10);
        let a = coalescer.coalesce("user-1", InboundMessage::new("user-1", "a"));
        let b = coalescer.coalesce("user-2", InboundMessage::new("user-2", "b"));

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].text, "a");
        assert_eq!(b[0].text, "b");
    }

    #[tokio::test]
    async fn test_timer_cleared_when_window_fills() {
        let timers = TimerRegistry::new();
        let coalescer = MessageCoalescer::new(
            CoalesceSettings {
                window_ms: 5_000,
                max_messages: 2,
                ..Default::default()
            },
            timers.clone(),
        );

        let a = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "a"));
        let b = coalescer.coalesce_entry("user-1", InboundMessage::new("user-1", "b"));
        let _ = tokio::join!(a, b);

        assert!(timers.is_empty());
    }

    #[test]
    fn test_combine_empty() {
        let coalescer = coalescer(1_000, 10);
        let combined = coalescer.combine(&[]);
        assert!(combined.text.is_empty());
        assert!(combined.images.is_empty());
    }

    #[test]
    fn test_combine_single_passes_through() {
        let coalescer = coalescer(1_000, 10);
        let combined = coalescer.combine(&[InboundMessage::new("s", "  keep my spacing  ")]);
        assert_eq!(combined.text, "  keep my spacing  ");
    }

    #[test]
    fn test_combine_joins_with_blank_lines() {
        let coalescer = coalescer(1_000, 10);
        let messages = vec![
            InboundMessage::new("s", " a "),
            InboundMessage::new("s", "b"),
            InboundMessage::new("s", "c\n"),
        ];
        assert_eq!(coalescer.combine(&messages).text, "a\n\nb\n\nc");
    }

    #[test]
    fn test_combine_concatenates_images_in_order() {
        use crate::message::ImageAttachment;
        let coalescer = coalescer(1_000, 10);
        let messages = vec![
            InboundMessage::new("s", "one")
                .with_images(vec![ImageAttachment::new("https://img/1")]),
            InboundMessage::new("s", "two").with_images(vec![
                ImageAttachment::new("https://img/2"),
                ImageAttachment::new("https://img/3"),
            ]),
        ];
        let combined = coalescer.combine(&messages);
        let urls: Vec<&str> = combined.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["https://img/1", "https://img/2", "https://img/3"]);
    }
}
