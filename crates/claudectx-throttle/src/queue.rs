//! Priority request queue manager.
//!
//! Provides `RequestQueueManager` for running asynchronous units of work in
//! priority order under a per-queue concurrency cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     enqueue()      ┌──────────────────────────┐
//! │    caller     │ ─────────────────► │   RequestQueueManager    │
//! │  (awaiting)   │                    │                          │
//! └───────────────┘                    │  queues: name -> backlog │
//!        │                             │  (BinaryHeap, in_flight) │
//!        │  RequestHandle<T>           │  wake: Notify            │
//!        │◄────────────────────────────│                          │
//!        │                             └──────────────────────────┘
//!        │                                       │
//!        │                                       │ dispatch loop picks the
//!        │                                       │ highest ready entry among
//!        │                                       │ queues with a free slot
//!        │                                       ▼
//!        │                             ┌──────────────────────────┐
//!        │                             │  Work task (one per item)│
//!        │                             │  - panic captured        │
//!        │                             │  - metrics recorded      │
//!        │  oneshot result             │  - slot freed, loop woken│
//!        │◄────────────────────────────└──────────────────────────┘
//! ```
//!
//! Ordering is strict: higher priority first, then enqueue order across all
//! queues. Sustained high-priority load can starve `Low` entries; callers
//! that need fairness give background work its own queue and cap.
//!
//! ## Stopping
//!
//! [`RequestQueueManager::stop`] drains in-flight work and cancels the
//! backlog: queued handles resolve to [`ThrottleError::Cancelled`], running
//! work completes and resolves normally, and `stop()` returns once it has.

use std::{
    any::Any,
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashMap},
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
    time::Duration,
};

use claudectx_core::config::QueuesConfig;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::{
    sync::{oneshot, Notify},
    time::Instant,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    priority::{QueueOrder, RequestPriority},
    ThrottleError,
};

/// Queue used when callers do not name one
pub const DEFAULT_QUEUE: &str = "default";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Internal state
// ============================================================================

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Panicked,
}

/// Result of running a unit of work, with the caller notification deferred
/// until metrics are recorded.
struct Finished {
    outcome: Outcome,
    deliver: Box<dyn FnOnce() + Send>,
}

/// A backlog entry. Dropping it drops the result sender, which resolves the
/// caller's handle to `Cancelled`.
struct Pending {
    order: QueueOrder,
    enqueued_at: Instant,
    job: BoxFuture<'static, Finished>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.cmp(&other.order)
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    total_enqueued: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    latency_total: Duration,
    latency_count: u64,
    wait_total: Duration,
    wait_count: u64,
}

fn average_ms(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() * 1000.0 / count as f64
    }
}

struct QueueState {
    max_concurrent: usize,
    in_flight: usize,
    backlog: BinaryHeap<Pending>,
    stats: QueueStats,
}

impl QueueState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            in_flight: 0,
            backlog: BinaryHeap::new(),
            stats: QueueStats::default(),
        }
    }

    fn has_free_slot(&self) -> bool {
        self.in_flight < self.max_concurrent
    }

    fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_enqueued: self.stats.total_enqueued,
            completed: self.stats.completed,
            failed: self.stats.failed,
            cancelled: self.stats.cancelled,
            backlog: self.backlog.len(),
            in_flight: self.in_flight,
            max_concurrent: self.max_concurrent,
            avg_latency_ms: average_ms(self.stats.latency_total, self.stats.latency_count),
            avg_wait_ms: average_ms(self.stats.wait_total, self.stats.wait_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct SchedulerState {
    lifecycle: Lifecycle,
    default_max_concurrent: usize,
    next_seq: u64,
    queues: HashMap<String, QueueState>,
}

impl SchedulerState {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        let default_cap = self.default_max_concurrent;
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(default_cap))
    }

    /// Removes every backlog entry, counting them as cancelled.
    fn cancel_backlog(&mut self) -> Vec<Pending> {
        let mut cancelled = Vec::new();
        for queue in self.queues.values_mut() {
            queue.stats.cancelled += queue.backlog.len() as u64;
            cancelled.extend(queue.backlog.drain());
        }
        cancelled
    }

    /// Pops entries until no queue has both a free slot and a ready entry.
    ///
    /// Each pick is the single highest-ordered head among eligible queues.
    fn take_ready(&mut self) -> Vec<(String, Pending)> {
        let mut ready = Vec::new();
        loop {
            let next = self
                .queues
                .iter()
                .filter(|(_, q)| q.has_free_slot())
                .filter_map(|(name, q)| q.backlog.peek().map(|p| (p.order, name)))
                .max_by_key(|(order, _)| *order)
                .map(|(_, name)| name.clone());

            let Some(name) = next else { break };
            let Some(queue) = self.queues.get_mut(&name) else { break };
            let Some(pending) = queue.backlog.pop() else { break };

            queue.in_flight += 1;
            queue.stats.wait_total += pending.enqueued_at.elapsed();
            queue.stats.wait_count += 1;
            ready.push((name, pending));
        }
        ready
    }
}

struct Scheduler {
    state: Mutex<SchedulerState>,
    wake: Notify,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Dispatches every ready entry. Returns `false` once stopped.
    fn dispatch_ready(self: &Arc<Self>) -> bool {
        let ready = {
            let mut state = lock(&self.state);
            if state.lifecycle == Lifecycle::Stopped {
                return false;
            }
            state.take_ready()
        };

        for (queue, pending) in ready {
            debug!(
                queue = %queue,
                id = pending.order.seq,
                priority = %pending.order.priority,
                "Dispatching request"
            );
            let scheduler = Arc::clone(self);
            self.tracker.spawn(async move {
                let finished = pending.job.await;
                scheduler.finish(&queue, pending.order.seq, finished.outcome, pending.enqueued_at);
                (finished.deliver)();
                scheduler.wake.notify_one();
            });
        }
        true
    }

    fn finish(&self, queue_name: &str, id: u64, outcome: Outcome, enqueued_at: Instant) {
        let latency = enqueued_at.elapsed();
        let mut state = lock(&self.state);
        let queue = state.queue_mut(queue_name);
        queue.in_flight = queue.in_flight.saturating_sub(1);
        queue.stats.latency_total += latency;
        queue.stats.latency_count += 1;
        match outcome {
            Outcome::Completed => queue.stats.completed += 1,
            Outcome::Failed | Outcome::Panicked => queue.stats.failed += 1,
        }
        debug!(
            queue = queue_name,
            id,
            ?outcome,
            latency_ms = latency.as_millis() as u64,
            "Request finished"
        );
    }

    fn cancel(&self, queue_name: &str, id: u64) -> Option<Pending> {
        let mut state = lock(&self.state);
        let queue = state.queues.get_mut(queue_name)?;

        let mut entries = std::mem::take(&mut queue.backlog).into_vec();
        let removed = entries
            .iter()
            .position(|p| p.order.seq == id)
            .map(|pos| entries.swap_remove(pos));
        queue.backlog = BinaryHeap::from(entries);

        if removed.is_some() {
            queue.stats.cancelled += 1;
        }
        removed
    }
}

async fn dispatch_loop(scheduler: Arc<Scheduler>) {
    debug!("Dispatch loop started");
    while scheduler.dispatch_ready() {
        scheduler.wake.notified().await;
    }
    debug!("Dispatch loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// QueueMetrics
// ============================================================================

/// Counters and current state for one queue.
///
/// `failed` includes work that panicked. Latency is measured from enqueue
/// to resolution; wait from enqueue to dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub backlog: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub avg_latency_ms: f64,
    pub avg_wait_ms: f64,
}

// ============================================================================
// RequestHandle
// ============================================================================

/// Awaitable result of an enqueued unit of work.
///
/// Resolves to the work's value, its error (`WorkFailed`), a captured panic
/// (`WorkPanicked`), or `Cancelled` when the entry left the backlog without
/// running. Dropping the handle does not cancel the work.
pub struct RequestHandle<T> {
    id: u64,
    priority: RequestPriority,
    queue: String,
    rx: oneshot::Receiver<Result<T, ThrottleError>>,
    scheduler: Weak<Scheduler>,
}

impl<T> RequestHandle<T> {
    /// Sequence number assigned at enqueue.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Removes the entry from its backlog if it has not been dispatched.
    ///
    /// Returns `true` when the entry was removed; the handle then resolves
    /// to `Cancelled`. Returns `false` once the work is in flight or done.
    pub fn cancel(&self) -> bool {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return false;
        };
        let removed = scheduler.cancel(&self.queue, self.id);
        let cancelled = removed.is_some();
        drop(removed);

        if cancelled {
            debug!(queue = %self.queue, id = self.id, "Request cancelled");
        }
        cancelled
    }
}

impl<T> std::fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = Result<T, ThrottleError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ThrottleError::Cancelled)))
    }
}

// ============================================================================
// RequestQueueManager
// ============================================================================

/// Priority-ordered, concurrency-capped scheduler for asynchronous work.
///
/// # Example
///
/// ```rust,no_run
/// use claudectx_throttle::{RequestPriority, RequestQueueManager, DEFAULT_QUEUE};
///
/// # async fn example() -> anyhow::Result<()> {
/// let manager = RequestQueueManager::new(2)?;
/// manager.start()?;
///
/// let handle = manager.enqueue(
///     || async { Ok::<_, anyhow::Error>(42) },
///     RequestPriority::High,
///     DEFAULT_QUEUE,
/// )?;
/// assert_eq!(handle.await?, 42);
///
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct RequestQueueManager {
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for RequestQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.scheduler.state);
        f.debug_struct("RequestQueueManager")
            .field("lifecycle", &state.lifecycle)
            .field("default_max_concurrent", &state.default_max_concurrent)
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl RequestQueueManager {
    /// Creates a stopped manager whose queues default to `default_max_concurrent`.
    ///
    /// # Errors
    /// `InvalidConfig` when the cap is zero.
    pub fn new(default_max_concurrent: usize) -> Result<Self, ThrottleError> {
        if default_max_concurrent == 0 {
            return Err(ThrottleError::InvalidConfig(
                "default_max_concurrent must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            scheduler: Arc::new(Scheduler {
                state: Mutex::new(SchedulerState {
                    lifecycle: Lifecycle::Idle,
                    default_max_concurrent,
                    next_seq: 0,
                    queues: HashMap::new(),
                }),
                wake: Notify::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Builds a manager from the YAML `queues` section, applying overrides.
    pub fn from_settings(settings: &QueuesConfig) -> Result<Self, ThrottleError> {
        let manager = Self::new(settings.default_max_concurrent)?;
        for (name, cap) in &settings.overrides {
            manager.configure_queue(name, *cap)?;
        }
        Ok(manager)
    }

    /// Sets the concurrency cap of `name`, creating the queue if needed.
    ///
    /// Lowering the cap below the current in-flight count lets running work
    /// finish; no new work is dispatched until the queue is under the cap.
    pub fn configure_queue(&self, name: &str, max_concurrent: usize) -> Result<(), ThrottleError> {
        if max_concurrent == 0 {
            return Err(ThrottleError::InvalidConfig(format!(
                "queue '{name}': max_concurrent must be at least 1"
            )));
        }

        lock(&self.scheduler.state).queue_mut(name).max_concurrent = max_concurrent;
        debug!(queue = name, max_concurrent, "Queue configured");
        self.scheduler.wake.notify_one();
        Ok(())
    }

    /// Spawns the dispatch loop. Must be called within a Tokio runtime.
    ///
    /// Idempotent while running; returns `QueueClosed` after `stop()`.
    pub fn start(&self) -> Result<(), ThrottleError> {
        {
            let mut state = lock(&self.scheduler.state);
            match state.lifecycle {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => return Err(ThrottleError::QueueClosed),
                Lifecycle::Idle => state.lifecycle = Lifecycle::Running,
            }
        }

        self.scheduler
            .tracker
            .spawn(dispatch_loop(Arc::clone(&self.scheduler)));
        info!("Request queue manager started");
        Ok(())
    }

    /// Stops dispatching, cancels the backlog and waits for in-flight work.
    ///
    /// Safe to call without a prior `start()`, and more than once.
    pub async fn stop(&self) {
        let cancelled = {
            let mut state = lock(&self.scheduler.state);
            let was = state.lifecycle;
            state.lifecycle = Lifecycle::Stopped;
            let cancelled = state.cancel_backlog();
            if was != Lifecycle::Stopped {
                let in_flight: usize = state.queues.values().map(|q| q.in_flight).sum();
                info!(
                    cancelled = cancelled.len(),
                    in_flight, "Stopping request queue manager"
                );
            }
            cancelled
        };
        drop(cancelled);

        self.scheduler.wake.notify_one();
        self.scheduler.tracker.close();
        self.scheduler.tracker.wait().await;
    }

    /// Whether the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        lock(&self.scheduler.state).lifecycle == Lifecycle::Running
    }

    /// Adds `work` to the backlog of `queue_name` and returns its handle.
    ///
    /// `work` is called once, on its own task, when the entry is dispatched.
    /// Entries enqueued before `start()` wait in the backlog.
    ///
    /// # Errors
    /// `QueueClosed` once the manager has been stopped.
    pub fn enqueue<F, Fut, T>(
        &self,
        work: F,
        priority: RequestPriority,
        queue_name: &str,
    ) -> Result<RequestHandle<T>, ThrottleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let job = async move {
            let result = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await;

            let (outcome, value) = match result {
                Ok(Ok(value)) => (Outcome::Completed, Ok(value)),
                Ok(Err(e)) => {
                    warn!(error = %format!("{e:#}"), "Queued request failed");
                    (Outcome::Failed, Err(ThrottleError::WorkFailed(e)))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(panic = %message, "Queued request panicked");
                    (Outcome::Panicked, Err(ThrottleError::WorkPanicked(message)))
                }
            };

            Finished {
                outcome,
                deliver: Box::new(move || {
                    // The caller may have dropped its handle
                    let _ = tx.send(value);
                }),
            }
        }
        .boxed();

        let id = {
            let mut state = lock(&self.scheduler.state);
            if state.lifecycle == Lifecycle::Stopped {
                return Err(ThrottleError::QueueClosed);
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let queue = state.queue_mut(queue_name);
            queue.stats.total_enqueued += 1;
            queue.backlog.push(Pending {
                order: QueueOrder { priority, seq },
                enqueued_at: Instant::now(),
                job,
            });
            seq
        };

        debug!(queue = queue_name, id, %priority, "Request enqueued");
        self.scheduler.wake.notify_one();

        Ok(RequestHandle {
            id,
            priority,
            queue: queue_name.to_string(),
            rx,
            scheduler: Arc::downgrade(&self.scheduler),
        })
    }

    /// Metrics for one queue; zeros for a queue that was never used.
    pub fn metrics(&self, queue_name: &str) -> QueueMetrics {
        lock(&self.scheduler.state)
            .queues
            .get(queue_name)
            .map(QueueState::metrics)
            .unwrap_or_default()
    }

    /// Metrics for every known queue, keyed by name.
    pub fn get_all_metrics(&self) -> BTreeMap<String, QueueMetrics> {
        lock(&self.scheduler.state)
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.metrics()))
            .collect()
    }

    pub fn default_max_concurrent(&self) -> usize {
        lock(&self.scheduler.state).default_max_concurrent
    }
}

impl Drop for RequestQueueManager {
    /// Stops dispatching and cancels the backlog. In-flight work keeps
    /// running detached; call [`RequestQueueManager::stop`] to wait for it.
    fn drop(&mut self) {
        let cancelled = {
            let mut state = lock(&self.scheduler.state);
            state.lifecycle = Lifecycle::Stopped;
            state.cancel_backlog()
        };
        drop(cancelled);
        self.scheduler.wake.notify_one();
        self.scheduler.tracker.close();
    }
}
