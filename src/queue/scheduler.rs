//! The lane and session schedulers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::TaskError;
use crate::queue::types::{
    DrainReport, LaneStats, Priority, QueueStats, SessionStats, SessionSubmitOptions,
    SubmitOptions, WaitCallback,
};

const DRAIN_POLL: Duration = Duration::from_millis(250);

type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    id: u64,
    priority: Priority,
    enqueued_at: Instant,
    warn_after: Duration,
    on_wait: Option<WaitCallback>,
    run: TaskFn,
}

struct Lane {
    buckets: [VecDeque<QueuedTask>; 3],
    active: usize,
    max_concurrent: usize,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            buckets: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            active: 0,
            max_concurrent: max_concurrent.max(1),
        }
    }

    fn queued(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// First entry of the lowest-numbered non-empty bucket.
    fn pop_next(&mut self) -> Option<QueuedTask> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }
}

#[derive(Default)]
struct SessionLane {
    queue: VecDeque<QueuedTask>,
    active: bool,
}

struct QueueState {
    lanes: HashMap<String, Lane>,
    sessions: HashMap<String, SessionLane>,
    active_sessions: usize,
    max_concurrent_sessions: usize,
    /// Ids of named-lane tasks currently running; the drain snapshot.
    active_named: HashSet<u64>,
    next_task_id: u64,
}

/// The scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl TaskQueue {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                lanes: HashMap::new(),
                sessions: HashMap::new(),
                active_sessions: 0,
                max_concurrent_sessions: max_concurrent_sessions.max(1),
                active_named: HashSet::new(),
                next_task_id: 0,
            })),
        }
    }

    /// Enqueue a task on a named lane. The lane is created on first use
    /// with a concurrency of 1.
    ///
    /// The returned future settles with the task's result; dropping it
    /// does not cancel the task.
    pub fn submit<F, Fut, T>(
        &self,
        lane: &str,
        opts: SubmitOptions,
        task: F,
    ) -> impl Future<Output = Result<T, TaskError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        let (run, rx) = wrap_task(format!("lane:{lane}"), is_probe_scope(lane), task);
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_task_id;
            state.next_task_id += 1;
            let entry = QueuedTask {
                id,
                priority: opts.priority,
                enqueued_at: Instant::now(),
                warn_after: opts.warn_after,
                on_wait: opts.on_wait,
                run,
            };
            let lane_state = state
                .lanes
                .entry(lane.to_string())
                .or_insert_with(|| Lane::new(1));
            lane_state.buckets[opts.priority.index()].push_back(entry);
        }
        self.pump_lane(lane);
        settle(rx)
    }

    /// Enqueue a task on a session lane.
    ///
    /// Within a session, execution is strictly serial. The entry is placed
    /// before the first queued entry of strictly lower priority, otherwise
    /// appended.
    pub fn submit_session<F, Fut, T>(
        &self,
        opts: SessionSubmitOptions,
        task: F,
    ) -> impl Future<Output = Result<T, TaskError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        let key = opts.session_key;
        let scope = format!("session:{key}");
        let (run, rx) = wrap_task(scope.clone(), is_probe_scope(&scope), task);
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_task_id;
            state.next_task_id += 1;
            let entry = QueuedTask {
                id,
                priority: opts.priority,
                enqueued_at: Instant::now(),
                warn_after: opts.warn_after,
                on_wait: opts.on_wait,
                run,
            };
            let lane = state.sessions.entry(key.clone()).or_default();
            let pos = lane
                .queue
                .iter()
                .position(|queued| queued.priority > entry.priority)
                .unwrap_or(lane.queue.len());
            lane.queue.insert(pos, entry);
        }
        self.drain_session(&key);
        settle(rx)
    }

    /// Set a named lane's concurrency, creating the lane if needed.
    pub fn configure_lane(&self, lane: &str, max_concurrent: usize) {
        {
            let mut state = self.state.lock().unwrap();
            let lane_state = state
                .lanes
                .entry(lane.to_string())
                .or_insert_with(|| Lane::new(1));
            lane_state.max_concurrent = max_concurrent.max(1);
        }
        self.pump_lane(lane);
    }

    /// Raise or lower the global session cap, activating idle sessions if
    /// room opened up.
    pub fn set_max_concurrent_sessions(&self, max: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.max_concurrent_sessions = max.max(1);
        }
        self.activate_idle_sessions();
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        let mut stats = QueueStats::default();

        for (name, lane) in &state.lanes {
            stats.lanes.insert(
                name.clone(),
                LaneStats {
                    queued: lane.queued(),
                    active: lane.active,
                    max_concurrent: lane.max_concurrent,
                },
            );
            for (index, bucket) in lane.buckets.iter().enumerate() {
                let priority = match index {
                    0 => Priority::Urgent,
                    1 => Priority::Normal,
                    _ => Priority::Background,
                };
                stats.by_priority.bump(priority, bucket.len());
            }
        }

        stats.sessions = SessionStats {
            total: state.sessions.len(),
            active: state.active_sessions,
            max_concurrent: state.max_concurrent_sessions,
        };
        for lane in state.sessions.values() {
            for queued in &lane.queue {
                stats.by_priority.bump(queued.priority, 1);
            }
        }
        stats
    }

    /// Wait for the named-lane tasks active right now to finish.
    ///
    /// Polls at 250 ms. Tasks enqueued after this call are not waited on,
    /// and session-lane tasks are out of scope.
    pub async fn wait_for_active_tasks(&self, timeout: Duration) -> DrainReport {
        let snapshot: HashSet<u64> = { self.state.lock().unwrap().active_named.clone() };
        let deadline = Instant::now() + timeout;
        loop {
            let still_running = {
                let state = self.state.lock().unwrap();
                snapshot.iter().any(|id| state.active_named.contains(id))
            };
            if !still_running {
                return DrainReport { drained: true };
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "drain deadline hit with tasks still active"
                );
                return DrainReport { drained: false };
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    fn pump_lane(&self, lane: &str) {
        loop {
            let popped = {
                let mut state = self.state.lock().unwrap();
                let Some(lane_state) = state.lanes.get_mut(lane) else {
                    return;
                };
                if lane_state.active >= lane_state.max_concurrent {
                    return;
                }
                let Some(task) = lane_state.pop_next() else {
                    return;
                };
                lane_state.active += 1;
                let remaining = lane_state.queued();
                state.active_named.insert(task.id);
                (task, remaining)
            };
            let (task, remaining) = popped;
            let scope = format!("lane:{lane}");
            report_wait(&scope, task.enqueued_at, task.warn_after, remaining, task.on_wait);

            let queue = self.clone();
            let lane_name = lane.to_string();
            let id = task.id;
            let run = task.run;
            tokio::spawn(async move {
                run().await;
                queue.finish_named(&lane_name, id);
            });
        }
    }

    fn finish_named(&self, lane: &str, id: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(lane_state) = state.lanes.get_mut(lane) {
                lane_state.active = lane_state.active.saturating_sub(1);
            }
            state.active_named.remove(&id);
        }
        self.pump_lane(lane);
    }

    fn drain_session(&self, key: &str) {
        let popped = {
            let mut state = self.state.lock().unwrap();
            if state.active_sessions >= state.max_concurrent_sessions {
                return;
            }
            let Some(lane) = state.sessions.get_mut(key) else {
                return;
            };
            if lane.active {
                return;
            }
            let Some(task) = lane.queue.pop_front() else {
                return;
            };
            lane.active = true;
            let remaining = lane.queue.len();
            state.active_sessions += 1;
            (task, remaining)
        };
        let (task, remaining) = popped;
        let scope = format!("session:{key}");
        report_wait(&scope, task.enqueued_at, task.warn_after, remaining, task.on_wait);

        let queue = self.clone();
        let session_key = key.to_string();
        let run = task.run;
        tokio::spawn(async move {
            run().await;
            queue.finish_session(&session_key);
        });
    }

    fn finish_session(&self, key: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(lane) = state.sessions.get_mut(key) {
                lane.active = false;
                if lane.queue.is_empty() {
                    state.sessions.remove(key);
                }
            }
            state.active_sessions = state.active_sessions.saturating_sub(1);
        }
        self.drain_session(key);
        self.activate_idle_sessions();
    }

    /// Scan every session lane and start any idle one with pending work,
    /// until the global cap is hit. Keeps continuously-queued sessions
    /// from starving.
    fn activate_idle_sessions(&self) {
        let candidates: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .iter()
                .filter(|(_, lane)| !lane.active && !lane.queue.is_empty())
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in candidates {
            self.drain_session(&key);
        }
    }
}

/// Box the user task so it always settles the caller's oneshot, catching
/// panics and logging failures (quietly for probe scopes).
fn wrap_task<F, Fut, T>(
    scope: String,
    quiet: bool,
    task: F,
) -> (TaskFn, oneshot::Receiver<Result<T, TaskError>>)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let run: TaskFn = Box::new(move || {
        async move {
            // The closure call happens inside the guard too, so a panic
            // while building the future still settles the caller.
            let guarded = AssertUnwindSafe(async move { task().await });
            let result = match guarded.catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Panicked),
            };
            if let Err(err) = &result {
                if !quiet {
                    tracing::error!(scope = %scope, error = %err, "queued task failed");
                }
            }
            let _ = tx.send(result);
        }
        .boxed()
    });
    (run, rx)
}

async fn settle<T>(rx: oneshot::Receiver<Result<T, TaskError>>) -> Result<T, TaskError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Cancelled),
    }
}

fn report_wait(
    scope: &str,
    enqueued_at: Instant,
    warn_after: Duration,
    remaining: usize,
    on_wait: Option<WaitCallback>,
) {
    let waited = enqueued_at.elapsed();
    if waited < warn_after {
        return;
    }
    if !is_probe_scope(scope) {
        tracing::warn!(
            scope,
            waited_ms = waited.as_millis() as u64,
            remaining,
            "task sat in queue past its warn threshold"
        );
    }
    if let Some(callback) = on_wait {
        callback(waited, remaining);
    }
}

/// Probe scopes suppress error/warn logs; they have no semantic effect.
fn is_probe_scope(scope: &str) -> bool {
    scope.starts_with("auth-probe:") || scope.starts_with("session:probe-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> TaskQueue {
        TaskQueue::new(16)
    }

    #[tokio::test]
    async fn test_lane_runs_task_and_returns_result() {
        let queue = queue();
        let result = queue
            .submit("main", SubmitOptions::default(), || async {
                Ok::<_, TaskError>(41 + 1)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_lane_error_settles_future_and_pump_survives() {
        let queue = queue();
        let failed = queue
            .submit("main", SubmitOptions::default(), || async {
                Err::<(), _>(TaskError::failed("nope"))
            })
            .await;
        assert!(matches!(failed, Err(TaskError::Failed(_))));

        let ok = queue
            .submit("main", SubmitOptions::default(), || async {
                Ok::<_, TaskError>("still alive")
            })
            .await;
        assert_eq!(ok.unwrap(), "still alive");
    }

    #[tokio::test]
    async fn test_lane_panic_becomes_task_error() {
        let queue = queue();
        let result = queue
            .submit("main", SubmitOptions::default(), || async {
                let boom = true;
                if boom {
                    panic!("task exploded");
                }
                Ok::<(), TaskError>(())
            })
            .await;
        assert!(matches!(result, Err(TaskError::Panicked)));

        let stats = queue.queue_stats();
        assert_eq!(stats.lanes["main"].active, 0);
    }

    #[tokio::test]
    async fn test_lane_respects_max_concurrent() {
        let queue = queue();
        queue.configure_lane("work", 2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for _ in 0..6 {
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            futures.push(queue.submit("work", SubmitOptions::default(), move || async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            }));
        }
        for f in futures {
            f.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_priority_preemption_of_waiting_work() {
        let queue = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let order_a = Arc::clone(&order);
        let a = queue.submit("main", SubmitOptions::default(), move || async move {
            let _ = gate_rx.await;
            order_a.lock().unwrap().push("A");
            Ok::<_, TaskError>(())
        });
        // Give A a moment to occupy the lane before queueing the rest.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let order_b = Arc::clone(&order);
        let b = queue.submit(
            "main",
            SubmitOptions::default().with_priority(Priority::Background),
            move || async move {
                order_b.lock().unwrap().push("B");
                Ok::<_, TaskError>(())
            },
        );
        let order_c = Arc::clone(&order);
        let c = queue.submit(
            "main",
            SubmitOptions::default().with_priority(Priority::Urgent),
            move || async move {
                order_c.lock().unwrap().push("C");
                Ok::<_, TaskError>(())
            },
        );
        let order_d = Arc::clone(&order);
        let d = queue.submit("main", SubmitOptions::default(), move || async move {
            order_d.lock().unwrap().push("D");
            Ok::<_, TaskError>(())
        });

        gate_tx.send(()).unwrap();
        let _ = tokio::join!(a, b, c, d);

        assert_eq!(*order.lock().unwrap(), vec!["A", "C", "D", "B"]);
    }

    #[tokio::test]
    async fn test_session_serializes_strictly() {
        let queue = queue();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for _ in 0..4 {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            futures.push(queue.submit_session(
                SessionSubmitOptions::new("user-1"),
                move || async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(())
                },
            ));
        }
        for f in futures {
            f.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_session_cap() {
        let queue = TaskQueue::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for session in ["s1", "s2", "s3"] {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            futures.push(queue.submit_session(
                SessionSubmitOptions::new(session),
                move || async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(())
                },
            ));
        }
        for f in futures {
            f.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_priority_insertion() {
        let queue = TaskQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        // Occupy the only session slot so later submissions queue up.
        let blocker = queue.submit_session(SessionSubmitOptions::new("busy"), move || async move {
            let _ = gate_rx.await;
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut futures = Vec::new();
        for (name, priority) in [
            ("normal-1", Priority::Normal),
            ("background", Priority::Background),
            ("urgent", Priority::Urgent),
            ("normal-2", Priority::Normal),
        ] {
            let order = Arc::clone(&order);
            futures.push(queue.submit_session(
                SessionSubmitOptions::new("busy").with_priority(priority),
                move || async move {
                    order.lock().unwrap().push(name);
                    Ok::<_, TaskError>(())
                },
            ));
        }

        gate_tx.send(()).unwrap();
        blocker.await.unwrap();
        for f in futures {
            f.await.unwrap();
        }

        // Urgent jumps ahead of both normals; normals keep FIFO between
        // themselves; background runs last.
        assert_eq!(
            *order.lock().unwrap(),
            vec!["urgent", "normal-1", "normal-2", "background"]
        );
    }

    #[tokio::test]
    async fn test_single_session_slot_runs_in_enqueue_order() {
        let queue = TaskQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_1 = Arc::clone(&order);
        let first = queue.submit_session(SessionSubmitOptions::new("s1"), move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            order_1.lock().unwrap().push("s1");
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let order_2 = Arc::clone(&order);
        let second = queue.submit_session(SessionSubmitOptions::new("s2"), move || async move {
            order_2.lock().unwrap().push("s2");
            Ok::<_, TaskError>(())
        });

        let _ = tokio::join!(first, second);
        assert_eq!(*order.lock().unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_on_wait_fires_for_slow_dequeue() {
        let queue = queue();
        let warned = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let blocker = queue.submit("main", SubmitOptions::default(), move || async move {
            let _ = gate_rx.await;
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let warned_clone = Arc::clone(&warned);
        let waiting = queue.submit(
            "main",
            SubmitOptions::default()
                .with_warn_after(Duration::from_millis(10))
                .with_on_wait(move |waited, _remaining| {
                    assert!(waited >= Duration::from_millis(10));
                    warned_clone.fetch_add(1, Ordering::SeqCst);
                }),
            || async { Ok::<_, TaskError>(()) },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        gate_tx.send(()).unwrap();
        let _ = tokio::join!(blocker, waiting);
        assert_eq!(warned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_stats_counts() {
        let queue = queue();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let running = queue.submit("main", SubmitOptions::default(), move || async move {
            let _ = gate_rx.await;
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = queue.submit(
            "main",
            SubmitOptions::default().with_priority(Priority::Urgent),
            || async { Ok::<_, TaskError>(()) },
        );

        let stats = queue.queue_stats();
        assert_eq!(stats.lanes["main"].active, 1);
        assert_eq!(stats.lanes["main"].queued, 1);
        assert_eq!(stats.lanes["main"].max_concurrent, 1);
        assert_eq!(stats.by_priority.urgent, 1);

        gate_tx.send(()).unwrap();
        let _ = tokio::join!(running, queued);
    }

    #[tokio::test]
    async fn test_wait_for_active_tasks_ignores_later_submissions() {
        let queue = queue();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let active = queue.submit("main", SubmitOptions::default(), move || async move {
            let _ = gate_rx.await;
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let queue_clone = queue.clone();
        let waiter = tokio::spawn(async move {
            queue_clone
                .wait_for_active_tasks(Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Submitted after the snapshot; must not block the drain.
        let late = queue.submit("other", SubmitOptions::default(), || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, TaskError>(())
        });
        drop(late);

        gate_tx.send(()).unwrap();
        active.await.unwrap();
        let report = waiter.await.unwrap();
        assert!(report.drained);
    }

    #[tokio::test]
    async fn test_wait_for_active_tasks_times_out() {
        let queue = queue();
        let slow = queue.submit("main", SubmitOptions::default(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TaskError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = queue.wait_for_active_tasks(Duration::from_millis(50)).await;
        assert!(!report.drained);
        drop(slow);
    }

    #[tokio::test]
    async fn test_dropped_future_does_not_cancel_task() {
        let queue = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let fut = queue.submit("main", SubmitOptions::default(), move || async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TaskError>(())
        });
        drop(fut);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
