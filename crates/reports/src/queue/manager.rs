//! Priority/delay scheduling with bounded retry on top of the controller.
//!
//! ## Design
//!
//! - Ready heap (priority, then FIFO) and delayed heap (by `scheduled_at`),
//!   both bounded by `max_queue_size`; a full heap rejects `enqueue` at once
//! - A dispatcher thread starts ready tasks while the controller has fewer than
//!   `max_concurrent_tasks` active tasks, and spawns one monitor per dispatch
//! - A promoter thread moves due delayed tasks to the ready heap
//! - Monitors poll the controller; failures are re-scheduled after a fixed
//!   `retry_delay` until `max_retries` is used up, then land in the failed list
//! - Every structure has its own lock and no path holds two at once. A task
//!   moving between structures is tracked by [`Transfers`] so lookups never
//!   report it missing while it is in flight
//! - The queue task id is stable across retries; each dispatch gets a fresh
//!   controller task id

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use stockview_core::{lock_or_recover, Priority, Report, ReportParams, TaskId, TaskStatus};

use super::heap::{ByPriority, BySchedule, TaskHeap};
use super::types::{
    FailedTask, QueueStats, QueueTaskInfo, QueuedTask, TaskCallback, TaskLocation, TaskRequest,
};
use crate::config::{ControllerConfig, QueueConfig};
use crate::controller::AsyncReportController;
use crate::error::{ControllerError, QueueError, QueueKind};
use crate::registry::GeneratorRegistry;

const SOURCE: &str = "reports::queue";

/// Upper bound on lookups while a task is moving between structures.
const SETTLE_ATTEMPTS: usize = 10_000;

const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(1);

/// Tracks tasks in transit between two structures.
#[derive(Debug, Default)]
struct Transfers {
    in_flight: AtomicUsize,
    started: AtomicU64,
}

struct TransferGuard<'a>(&'a Transfers);

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transfers {
    fn begin(&self) -> TransferGuard<'_> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TransferGuard(self)
    }

    fn mark(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// No transfer was running or started since `mark`.
    fn settled_since(&self, mark: u64) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.started.load(Ordering::SeqCst) == mark
    }
}

#[derive(Debug, Clone)]
struct RunningTask {
    task: QueuedTask,
    controller_id: TaskId,
}

#[derive(Debug, Clone)]
struct FailedEntry {
    task: QueuedTask,
    error: String,
    failed_at: chrono::DateTime<Utc>,
}

impl FailedEntry {
    fn public(&self) -> FailedTask {
        FailedTask {
            task_id: self.task.id,
            view_name: self.task.view,
            params: self.task.params.clone(),
            priority: self.task.priority,
            retry_count: self.task.retry_count,
            max_retries: self.task.max_retries,
            error_message: self.error.clone(),
            failed_at: self.failed_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FinishedOutcome {
    Completed { controller_id: TaskId },
    Cancelled,
}

/// Bounded history of completed and cancelled tasks, oldest evicted first.
#[derive(Debug)]
struct FinishedLog {
    entries: HashMap<TaskId, (QueuedTask, FinishedOutcome)>,
    order: VecDeque<TaskId>,
    capacity: usize,
}

impl FinishedLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, task: QueuedTask, outcome: FinishedOutcome) {
        let id = task.id;
        if self.entries.insert(id, (task, outcome)).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get(&self, id: TaskId) -> Option<&(QueuedTask, FinishedOutcome)> {
        self.entries.get(&id)
    }

    fn forget(&mut self, id: TaskId) {
        if self.entries.remove(&id).is_some() {
            self.order.retain(|x| *x != id);
        }
    }
}

/// Where a lookup found a task, with what the caller needs afterwards.
enum Found {
    Running(QueuedTask, TaskId),
    Ready(QueuedTask),
    Delayed(QueuedTask),
    Failed(QueuedTask, String),
    Finished(QueuedTask, FinishedOutcome),
}

struct QueueShared {
    config: QueueConfig,
    controller: Arc<AsyncReportController>,
    ready: Mutex<TaskHeap<ByPriority>>,
    delayed: Mutex<TaskHeap<BySchedule>>,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    failed: Mutex<VecDeque<FailedEntry>>,
    finished: Mutex<FinishedLog>,
    monitors: Mutex<Vec<thread::JoinHandle<()>>>,
    transfers: Transfers,
    seq: AtomicU64,
    stopping: AtomicBool,
}

#[derive(Debug)]
struct LoopHandle {
    name: &'static str,
    signal: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

/// Priority task queue in front of an [`AsyncReportController`].
pub struct TaskQueueManager {
    shared: Arc<QueueShared>,
    dispatcher: Mutex<Option<LoopHandle>>,
    promoter: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for TaskQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl TaskQueueManager {
    /// Start the dispatcher and promoter threads in front of `controller`.
    pub fn new(config: QueueConfig, controller: Arc<AsyncReportController>) -> Self {
        let shared = Arc::new(QueueShared {
            finished: Mutex::new(FinishedLog::new(config.max_failed_tasks)),
            config,
            controller,
            ready: Mutex::new(TaskHeap::default()),
            delayed: Mutex::new(TaskHeap::default()),
            running: Mutex::new(HashMap::new()),
            failed: Mutex::new(VecDeque::new()),
            monitors: Mutex::new(Vec::new()),
            transfers: Transfers::default(),
            seq: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        });

        let dispatcher = spawn_loop(
            "report-queue-dispatcher",
            shared.config.dispatch_interval,
            shared.clone(),
            |s| {
                s.dispatch_ready();
            },
        );
        let promoter = spawn_loop(
            "report-queue-promoter",
            shared.config.promotion_interval,
            shared.clone(),
            |s| {
                s.promote_due();
            },
        );

        info!(
            max_concurrent_tasks = shared.config.max_concurrent_tasks,
            max_queue_size = shared.config.max_queue_size,
            retry_delay_secs = shared.config.retry_delay.as_secs_f64(),
            "task queue started"
        );

        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
            promoter: Mutex::new(Some(promoter)),
        }
    }

    /// Queue with its own controller, sized to `max_concurrent_tasks` workers.
    pub fn with_generators(config: QueueConfig, registry: GeneratorRegistry) -> Self {
        let controller = AsyncReportController::new(
            ControllerConfig::default().with_max_workers(config.max_concurrent_tasks),
            registry,
        );
        Self::new(config, Arc::new(controller))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn controller(&self) -> &Arc<AsyncReportController> {
        &self.shared.controller
    }

    /// Enqueue a report run for immediate dispatch.
    pub fn enqueue(
        &self,
        view_name: &str,
        params: ReportParams,
        priority: Priority,
    ) -> Result<TaskId, QueueError> {
        self.enqueue_request(TaskRequest::new(view_name, params).with_priority(priority))
    }

    /// Enqueue with scheduling, retry and callback options. A `scheduled_at`
    /// in the future puts the task on the delayed heap.
    pub fn enqueue_request(&self, request: TaskRequest) -> Result<TaskId, QueueError> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        let (view, _) = self
            .shared
            .controller
            .registry()
            .resolve(&request.view_name)
            .map_err(|_| QueueError::UnknownView(request.view_name.clone()))?;

        let now = Utc::now();
        let task = QueuedTask {
            id: TaskId::new(),
            view,
            params: request.params,
            priority: request.priority,
            created_at: now,
            scheduled_at: request.scheduled_at,
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.shared.config.default_max_retries),
            callback: request.callback,
            seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
            last_error: None,
        };
        let id = task.id;
        let capacity = self.shared.config.max_queue_size;

        match task.scheduled_at {
            Some(at) if at > now => {
                let mut delayed = lock_or_recover(&self.shared.delayed, SOURCE, "enqueue");
                if delayed.len() >= capacity {
                    warn!(view = %view, capacity, "delayed queue full, task rejected");
                    return Err(QueueError::CapacityExceeded {
                        queue: QueueKind::Delayed,
                        capacity,
                    });
                }
                delayed.push(task);
                drop(delayed);
                info!(task_id = %id, view = %view, scheduled_at = %at, "delayed task enqueued");
            }
            _ => {
                let mut ready = lock_or_recover(&self.shared.ready, SOURCE, "enqueue");
                if ready.len() >= capacity {
                    warn!(view = %view, capacity, "task queue full, task rejected");
                    return Err(QueueError::CapacityExceeded {
                        queue: QueueKind::Ready,
                        capacity,
                    });
                }
                ready.push(task);
                drop(ready);
                info!(task_id = %id, view = %view, priority = %request.priority, "task enqueued");
                self.wake_dispatcher();
            }
        }

        Ok(id)
    }

    /// Enqueue several tasks in order. Not transactional: on the first error,
    /// tasks enqueued before it stay queued.
    pub fn enqueue_batch(
        &self,
        requests: impl IntoIterator<Item = TaskRequest>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut ids = Vec::new();
        for request in requests {
            match self.enqueue_request(request) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    error!(enqueued = ids.len(), error = %err, "batch enqueue stopped");
                    return Err(err);
                }
            }
        }
        info!(count = ids.len(), "batch enqueued");
        Ok(ids)
    }

    /// Current state of a queue task, wherever it is.
    pub fn status(&self, id: TaskId) -> Result<QueueTaskInfo, QueueError> {
        let found = self.shared.locate(id).ok_or(QueueError::NotFound(id))?;

        Ok(match found {
            Found::Running(task, controller_id) => match self.shared.controller.progress(controller_id) {
                Ok(p) => {
                    let mut info = task.info(TaskLocation::Running, p.status, p.progress);
                    if p.error_message.is_some() {
                        info.error_message = p.error_message;
                    }
                    info
                }
                Err(_) => task.info(TaskLocation::Running, TaskStatus::Running, 0.0),
            },
            Found::Ready(task) => task.info(TaskLocation::Ready, TaskStatus::Pending, 0.0),
            Found::Delayed(task) => task.info(TaskLocation::Delayed, TaskStatus::Pending, 0.0),
            Found::Failed(task, error) => {
                let mut info = task.info(TaskLocation::Failed, TaskStatus::Failed, 0.0);
                info.error_message = Some(error);
                info
            }
            Found::Finished(task, FinishedOutcome::Completed { .. }) => {
                task.info(TaskLocation::Finished, TaskStatus::Completed, 1.0)
            }
            Found::Finished(task, FinishedOutcome::Cancelled) => {
                task.info(TaskLocation::Finished, TaskStatus::Cancelled, 0.0)
            }
        })
    }

    /// Report rows of a completed task; `None` while queued, running or after
    /// cancellation. Failed tasks return their failure.
    pub fn result(&self, id: TaskId) -> Result<Option<Report>, QueueError> {
        let found = self.shared.locate(id).ok_or(QueueError::NotFound(id))?;

        let (controller_id, finished) = match found {
            Found::Running(_, cid) => (cid, false),
            Found::Finished(_, FinishedOutcome::Completed { controller_id }) => (controller_id, true),
            Found::Ready(_) | Found::Delayed(_) | Found::Finished(_, FinishedOutcome::Cancelled) => {
                return Ok(None);
            }
            Found::Failed(_, error) => return Err(QueueError::TaskFailed(error)),
        };

        match self.shared.controller.result(controller_id) {
            Ok(report) => Ok(report),
            Err(ControllerError::TaskFailed(msg)) => Err(QueueError::TaskFailed(msg)),
            Err(ControllerError::NotFound(_)) => {
                // The controller's retention sweep already dropped the result.
                if finished {
                    lock_or_recover(&self.shared.finished, SOURCE, "result").forget(id);
                }
                Err(QueueError::NotFound(id))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Cancel a running, ready or delayed task. Returns false for unknown or
    /// finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared
            .settle(|| self.shared.try_cancel(id))
            .unwrap_or(false)
    }

    /// Re-enqueue a task from the failed list, if it has retries left.
    pub fn retry(&self, id: TaskId) -> bool {
        let shared = &self.shared;

        let Some((entry, _transfer)) = shared.take(&shared.failed, "retry", |failed| {
            let pos = failed.iter().position(|e| e.task.id == id)?;
            let task = &failed[pos].task;
            if task.retry_count >= task.max_retries {
                warn!(task_id = %id, retry_count = task.retry_count, "task has no retries left");
                return None;
            }
            failed.remove(pos)
        }) else {
            return false;
        };

        let mut task = entry.task.clone();
        task.retry_count += 1;
        task.scheduled_at = None;
        let retry_count = task.retry_count;

        {
            let mut ready = lock_or_recover(&shared.ready, SOURCE, "retry");
            if ready.len() >= shared.config.max_queue_size {
                drop(ready);
                warn!(task_id = %id, "task queue full, retry refused");
                lock_or_recover(&shared.failed, SOURCE, "retry").push_back(entry);
                return false;
            }
            ready.push(task);
        }

        info!(task_id = %id, retry_count, "failed task re-enqueued");
        self.wake_dispatcher();
        true
    }

    /// Tasks that ran out of retries or were rejected at dispatch, oldest first.
    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        lock_or_recover(&self.shared.failed, SOURCE, "failed_tasks")
            .iter()
            .map(FailedEntry::public)
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let shared = &self.shared;
        let pending = lock_or_recover(&shared.ready, SOURCE, "stats").len();
        let delayed = lock_or_recover(&shared.delayed, SOURCE, "stats").len();
        let running = lock_or_recover(&shared.running, SOURCE, "stats").len();
        let failed = lock_or_recover(&shared.failed, SOURCE, "stats").len();

        QueueStats {
            pending,
            delayed,
            running,
            failed,
            max_concurrent_tasks: shared.config.max_concurrent_tasks,
            max_queue_size: shared.config.max_queue_size,
            queue_utilization: percent(pending, shared.config.max_queue_size),
            concurrent_utilization: percent(running, shared.config.max_concurrent_tasks),
        }
    }

    /// Move due delayed tasks to the ready heap now instead of waiting for
    /// the promoter. Returns how many moved.
    pub fn promote_due(&self) -> usize {
        let moved = self.shared.promote_due();
        if moved > 0 {
            self.wake_dispatcher();
        }
        moved
    }

    /// Stop the background threads (waiting at most `shutdown_timeout`), then
    /// shut the controller down.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("task queue shutting down");

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        let loops = [
            lock_or_recover(&self.dispatcher, SOURCE, "shutdown").take(),
            lock_or_recover(&self.promoter, SOURCE, "shutdown").take(),
        ];
        for handle in loops.into_iter().flatten() {
            let LoopHandle { name, signal, join } = handle;
            drop(signal);
            join_until(name, join, deadline);
        }

        let monitors: Vec<_> = lock_or_recover(&self.shared.monitors, SOURCE, "shutdown")
            .drain(..)
            .collect();
        for join in monitors {
            join_until("report-queue-monitor", join, deadline);
        }

        self.shared.controller.shutdown();
        info!("task queue stopped");
    }

    fn wake_dispatcher(&self) {
        if let Some(handle) = lock_or_recover(&self.dispatcher, SOURCE, "wake").as_ref() {
            let _ = handle.signal.send(());
        }
    }
}

impl Drop for TaskQueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl QueueShared {
    /// Re-run `lookup` until it finds something or no transfer could have hidden it.
    fn settle<T>(&self, mut lookup: impl FnMut() -> Option<T>) -> Option<T> {
        for _ in 0..SETTLE_ATTEMPTS {
            let mark = self.transfers.mark();
            if let Some(found) = lookup() {
                return Some(found);
            }
            if self.transfers.settled_since(mark) {
                return None;
            }
            thread::yield_now();
        }
        None
    }

    /// Take something out of the structure behind `lock`. The transfer begins
    /// before the lock is released, so a concurrent lookup either still sees
    /// the task or knows to look again. Nothing taken, no transfer.
    fn take<S, T>(
        &self,
        lock: &Mutex<S>,
        op: &'static str,
        take: impl FnOnce(&mut S) -> Option<T>,
    ) -> Option<(T, TransferGuard<'_>)> {
        let mut guard = lock_or_recover(lock, SOURCE, op);
        let taken = take(&mut guard)?;
        let transfer = self.transfers.begin();
        drop(guard);
        Some((taken, transfer))
    }

    fn locate(&self, id: TaskId) -> Option<Found> {
        self.settle(|| self.find_anywhere(id))
    }

    fn find_anywhere(&self, id: TaskId) -> Option<Found> {
        if let Some(r) = lock_or_recover(&self.running, SOURCE, "find").get(&id) {
            return Some(Found::Running(r.task.clone(), r.controller_id));
        }
        if let Some(t) = lock_or_recover(&self.ready, SOURCE, "find").find(id) {
            return Some(Found::Ready(t.clone()));
        }
        if let Some(t) = lock_or_recover(&self.delayed, SOURCE, "find").find(id) {
            return Some(Found::Delayed(t.clone()));
        }
        if let Some(e) = lock_or_recover(&self.failed, SOURCE, "find")
            .iter()
            .find(|e| e.task.id == id)
        {
            return Some(Found::Failed(e.task.clone(), e.error.clone()));
        }
        lock_or_recover(&self.finished, SOURCE, "find")
            .get(id)
            .map(|(task, outcome)| Found::Finished(task.clone(), *outcome))
    }

    /// `Some(cancelled)` if the task was found, `None` if it is unknown.
    fn try_cancel(&self, id: TaskId) -> Option<bool> {
        let controller_id = lock_or_recover(&self.running, SOURCE, "cancel")
            .get(&id)
            .map(|r| r.controller_id);

        if let Some(cid) = controller_id {
            if !self.controller.cancel(cid) {
                // Already terminal; its monitor settles it.
                return Some(false);
            }
            if let Some((r, _transfer)) = self.take(&self.running, "cancel", |m| m.remove(&id)) {
                lock_or_recover(&self.finished, SOURCE, "cancel")
                    .record(r.task, FinishedOutcome::Cancelled);
            }
            info!(task_id = %id, "running task cancelled");
            return Some(true);
        }

        let queued = match self.take(&self.ready, "cancel", |heap| heap.remove(id)) {
            Some((task, transfer)) => Some((task, transfer, "ready")),
            None => self
                .take(&self.delayed, "cancel", |heap| heap.remove(id))
                .map(|(task, transfer)| (task, transfer, "delayed")),
        };
        if let Some((task, _transfer, queue)) = queued {
            lock_or_recover(&self.finished, SOURCE, "cancel")
                .record(task, FinishedOutcome::Cancelled);
            info!(task_id = %id, queue, "queued task cancelled");
            return Some(true);
        }

        let failed = lock_or_recover(&self.failed, SOURCE, "cancel")
            .iter()
            .any(|e| e.task.id == id);
        if failed || lock_or_recover(&self.finished, SOURCE, "cancel").get(id).is_some() {
            return Some(false);
        }
        None
    }

    /// Start ready tasks while the controller has free slots.
    fn dispatch_ready(self: &Arc<Self>) -> usize {
        let mut dispatched = 0;

        while !self.stopping.load(Ordering::SeqCst)
            && self.controller.active_count() < self.config.max_concurrent_tasks
        {
            let Some((task, transfer)) = self.take(&self.ready, "dispatch", |heap| heap.pop()) else {
                break;
            };

            match self.controller.start_view(task.view, task.params.clone()) {
                Ok(controller_id) => {
                    let id = task.id;
                    lock_or_recover(&self.running, SOURCE, "dispatch").insert(
                        id,
                        RunningTask {
                            task,
                            controller_id,
                        },
                    );
                    drop(transfer);
                    info!(task_id = %id, controller_task_id = %controller_id, "task dispatched");
                    self.spawn_monitor(id, controller_id);
                    dispatched += 1;
                }
                Err(ControllerError::ShuttingDown) => {
                    lock_or_recover(&self.ready, SOURCE, "dispatch").push(task);
                    break;
                }
                Err(err) => {
                    error!(task_id = %task.id, error = %err, "task dispatch rejected");
                    self.push_failed(task, err.to_string());
                }
            }
        }

        dispatched
    }

    fn promote_due(&self) -> usize {
        let now = Utc::now();
        let Some((due, _transfer)) = self.take(&self.delayed, "promote", |heap| {
            let due = heap.pop_due(now);
            (!due.is_empty()).then_some(due)
        }) else {
            return 0;
        };

        let count = due.len();
        let mut ready = lock_or_recover(&self.ready, SOURCE, "promote");
        for task in due {
            ready.push(task);
        }
        drop(ready);

        info!(count, "delayed tasks promoted");
        count
    }

    fn spawn_monitor(self: &Arc<Self>, id: TaskId, controller_id: TaskId) {
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name("report-queue-monitor".to_string())
            .spawn(move || monitor_loop(shared, id, controller_id));

        match spawned {
            Ok(join) => {
                let mut monitors = lock_or_recover(&self.monitors, SOURCE, "spawn_monitor");
                monitors.retain(|m| !m.is_finished());
                monitors.push(join);
            }
            Err(err) => {
                error!(task_id = %id, error = %err, "failed to spawn monitor thread, monitoring inline");
                monitor_loop(self.clone(), id, controller_id);
            }
        }
    }

    /// Apply a terminal controller status to a dispatched task.
    fn settle_task(&self, id: TaskId, status: TaskStatus, error: Option<String>) {
        let Some((
            RunningTask {
                mut task,
                controller_id,
            },
            transfer,
        )) = self.take(&self.running, "settle", |m| m.remove(&id))
        else {
            // Cancelled through the queue, already recorded.
            return;
        };

        match status {
            TaskStatus::Completed => {
                let callback = task.callback.clone();
                lock_or_recover(&self.finished, SOURCE, "settle")
                    .record(task, FinishedOutcome::Completed { controller_id });
                drop(transfer);
                info!(task_id = %id, "task completed");

                if let Some(callback) = callback {
                    match self.controller.result(controller_id) {
                        Ok(Some(report)) => invoke_callback(&callback, id, &report),
                        Ok(None) => {}
                        Err(err) => error!(task_id = %id, error = %err, "result unavailable for callback"),
                    }
                }
            }
            TaskStatus::Cancelled => {
                lock_or_recover(&self.finished, SOURCE, "settle")
                    .record(task, FinishedOutcome::Cancelled);
                info!(task_id = %id, "task cancelled in controller");
            }
            _ => {
                let message = error.unwrap_or_else(|| "task failed".to_string());
                task.last_error = Some(message.clone());

                if task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    let now = Utc::now();
                    let at = chrono::Duration::from_std(self.config.retry_delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(now);
                    task.scheduled_at = Some(at);
                    let retry_count = task.retry_count;
                    lock_or_recover(&self.delayed, SOURCE, "settle").push(task);
                    warn!(task_id = %id, retry_count, error = %message, "task failed, retry scheduled");
                } else {
                    error!(task_id = %id, retry_count = task.retry_count, error = %message, "task failed, retries exhausted");
                    self.push_failed(task, message);
                }
            }
        }
    }

    fn push_failed(&self, task: QueuedTask, error: String) {
        let mut failed = lock_or_recover(&self.failed, SOURCE, "push_failed");
        failed.push_back(FailedEntry {
            task,
            error,
            failed_at: Utc::now(),
        });
        while failed.len() > self.config.max_failed_tasks.max(1) {
            failed.pop_front();
        }
    }
}

fn monitor_loop(shared: Arc<QueueShared>, id: TaskId, controller_id: TaskId) {
    let interval = shared.config.monitor_interval.max(MIN_LOOP_INTERVAL);

    while !shared.stopping.load(Ordering::SeqCst) {
        let terminal = match shared.controller.progress(controller_id) {
            Ok(p) if p.status.is_terminal() => Some((p.status, p.error_message)),
            Ok(_) => None,
            Err(err) => Some((TaskStatus::Failed, Some(err.to_string()))),
        };

        if let Some((status, error)) = terminal {
            shared.settle_task(id, status, error);
            return;
        }
        thread::sleep(interval);
    }
    debug!(task_id = %id, "monitor stopped by shutdown");
}

fn invoke_callback(callback: &TaskCallback, id: TaskId, report: &Report) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(id, report))).is_err() {
        error!(task_id = %id, "task completion callback panicked");
    }
}

fn spawn_loop(
    name: &'static str,
    interval: Duration,
    shared: Arc<QueueShared>,
    tick: fn(&Arc<QueueShared>),
) -> LoopHandle {
    let (signal, rx) = mpsc::channel::<()>();
    let interval = interval.max(MIN_LOOP_INTERVAL);

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                tick(&shared);
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(thread = name, "queue loop stopped");
        })
        .expect("failed to spawn task queue thread");

    LoopHandle { name, signal, join }
}

fn join_until(name: &str, join: thread::JoinHandle<()>, deadline: Instant) {
    while !join.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if join.is_finished() {
        let _ = join.join();
    } else {
        warn!(thread = name, "thread did not stop before the shutdown timeout, detaching");
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use stockview_core::ReportView;

    fn registry() -> GeneratorRegistry {
        GeneratorRegistry::new()
            .with(ReportView::InventoryReport, |_, _| Ok(vec![json!({"sku": "A"})]))
            .with(ReportView::SalesReport, |_, _| Ok(vec![]))
    }

    /// A queue whose dispatcher never starts anything.
    fn paused_queue(max_queue_size: usize) -> TaskQueueManager {
        TaskQueueManager::with_generators(
            QueueConfig::default()
                .with_max_concurrent_tasks(0)
                .with_max_queue_size(max_queue_size)
                .with_dispatch_interval(Duration::from_millis(10)),
            registry(),
        )
    }

    #[test]
    fn unknown_view_is_rejected_at_enqueue() {
        let q = paused_queue(10);
        assert_eq!(
            q.enqueue("no_such_view", ReportParams::new(), Priority::Normal),
            Err(QueueError::UnknownView("no_such_view".into()))
        );
        assert_eq!(
            q.enqueue("payables_report", ReportParams::new(), Priority::Normal),
            Err(QueueError::UnknownView("payables_report".into()))
        );
        assert_eq!(q.stats().pending, 0);
    }

    #[test]
    fn full_ready_heap_rejects_without_blocking() {
        let q = paused_queue(2);
        q.enqueue("inventory_report", ReportParams::new(), Priority::Normal).unwrap();
        q.enqueue("inventory_report", ReportParams::new(), Priority::Normal).unwrap();

        assert_eq!(
            q.enqueue("inventory_report", ReportParams::new(), Priority::Normal),
            Err(QueueError::CapacityExceeded {
                queue: QueueKind::Ready,
                capacity: 2
            })
        );
    }

    #[test]
    fn delayed_heap_has_its_own_capacity() {
        let q = paused_queue(1);
        let later = Utc::now() + chrono::Duration::hours(1);
        q.enqueue("inventory_report", ReportParams::new(), Priority::Normal).unwrap();
        let id = q
            .enqueue_request(TaskRequest::new("inventory_report", ReportParams::new()).scheduled_at(later))
            .unwrap();

        let info = q.status(id).unwrap();
        assert_eq!(info.location, TaskLocation::Delayed);
        assert_eq!(info.status, TaskStatus::Pending);

        assert_eq!(
            q.enqueue_request(TaskRequest::new("sales_report", ReportParams::new()).scheduled_at(later)),
            Err(QueueError::CapacityExceeded {
                queue: QueueKind::Delayed,
                capacity: 1
            })
        );
    }

    #[test]
    fn batch_enqueue_keeps_tasks_before_the_failure() {
        let q = paused_queue(10);
        let err = q
            .enqueue_batch([
                TaskRequest::new("inventory_report", ReportParams::new()),
                TaskRequest::new("sales_report", ReportParams::new()),
                TaskRequest::new("bogus", ReportParams::new()),
                TaskRequest::new("sales_report", ReportParams::new()),
            ])
            .unwrap_err();

        assert_eq!(err, QueueError::UnknownView("bogus".into()));
        assert_eq!(q.stats().pending, 2);
    }

    #[test]
    fn cancel_removes_from_ready_and_delayed_heaps() {
        let q = paused_queue(10);
        let ready = q.enqueue("inventory_report", ReportParams::new(), Priority::High).unwrap();
        let delayed = q
            .enqueue_request(
                TaskRequest::new("inventory_report", ReportParams::new())
                    .scheduled_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .unwrap();

        assert!(q.cancel(ready));
        assert!(!q.cancel(ready));
        assert!(q.cancel(delayed));
        assert!(!q.cancel(TaskId::new()));

        let stats = q.stats();
        assert_eq!((stats.pending, stats.delayed), (0, 0));
        assert_eq!(q.status(ready).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(q.result(delayed).unwrap(), None);
    }

    #[test]
    fn unknown_ids_settle_without_retrying() {
        let q = paused_queue(10);

        let mut lookups = 0;
        assert!(q
            .shared
            .settle(|| {
                lookups += 1;
                None::<()>
            })
            .is_none());
        assert_eq!(lookups, 1);

        let before = q.shared.transfers.mark();
        let started = Instant::now();
        assert!(!q.cancel(TaskId::new()));
        assert!(!q.retry(TaskId::new()));
        assert_eq!(q.shared.transfers.mark(), before);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let q = paused_queue(10);
        let id = TaskId::new();
        assert_eq!(q.status(id).unwrap_err(), QueueError::NotFound(id));
        assert_eq!(q.result(id).unwrap_err(), QueueError::NotFound(id));
        assert!(!q.retry(id));
    }

    #[test]
    fn promote_due_moves_past_schedules_to_ready() {
        let q = paused_queue(10);
        // In the past: goes straight to the ready heap.
        q.enqueue_request(
            TaskRequest::new("inventory_report", ReportParams::new())
                .scheduled_at(Utc::now() - chrono::Duration::seconds(1)),
        )
        .unwrap();
        assert_eq!(q.stats().pending, 1);

        let soon = q
            .enqueue_request(
                TaskRequest::new("inventory_report", ReportParams::new())
                    .scheduled_at(Utc::now() + chrono::Duration::milliseconds(30)),
            )
            .unwrap();
        assert_eq!(q.promote_due(), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(q.promote_due(), 1);
        assert_eq!(q.status(soon).unwrap().location, TaskLocation::Ready);
    }

    #[test]
    fn stats_report_utilization() {
        let q = paused_queue(4);
        q.enqueue("inventory_report", ReportParams::new(), Priority::Low).unwrap();
        let stats = q.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.queue_utilization, 25.0);
        assert_eq!(stats.concurrent_utilization, 0.0);
    }

    #[test]
    fn callback_panics_are_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let callback: TaskCallback = Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("callback bug");
        });

        invoke_callback(&callback, TaskId::new(), &vec![]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(0, 0), 0.0);
    }

    #[test]
    fn finished_log_is_bounded() {
        let mut log = FinishedLog::new(2);
        let now = Utc::now();
        let mut ids = Vec::new();
        for seq in 0..3 {
            let task = QueuedTask {
                id: TaskId::new(),
                view: ReportView::SalesReport,
                params: ReportParams::new(),
                priority: Priority::Normal,
                created_at: now,
                scheduled_at: None,
                retry_count: 0,
                max_retries: 0,
                callback: None,
                seq,
                last_error: None,
            };
            ids.push(task.id);
            log.record(task, FinishedOutcome::Cancelled);
        }
        assert!(log.get(ids[0]).is_none());
        assert!(log.get(ids[2]).is_some());
    }
}
