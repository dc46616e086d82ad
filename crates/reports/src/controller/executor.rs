//! Asynchronous report controller.
//!
//! ## Design
//!
//! - `start` validates the view, stores a `Pending` record and submits the run
//!   to a fixed-size [`WorkerPool`]; a full backlog fails fast
//! - Workers move the record through `Running` to a terminal state via the
//!   shared [`TaskTable`]; cancellation and timeouts only flip the status, so a
//!   generator that keeps running has its late result dropped
//! - One sweep thread force-fails tasks past the timeout and deletes terminal
//!   tasks once their retention window has elapsed
//! - `shutdown` stops the sweep and drains the pool

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use stockview_core::{lock_or_recover, Report, ReportParams, ReportView, TaskId, TaskStatus};

use super::handle::TaskHandle;
use super::pool::WorkerPool;
use super::table::TaskTable;
use super::types::{checkpoint, ControllerStats, TaskProgress, TaskRecord, TaskSnapshot};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::registry::{GeneratorRegistry, ReportGenerator};

const SOURCE: &str = "reports::controller";

/// Default page size of [`AsyncReportController::list`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

const CANCEL_REASON: &str = "cancelled by caller";
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs registered report generators on a bounded worker pool.
#[derive(Debug)]
pub struct AsyncReportController {
    config: ControllerConfig,
    registry: GeneratorRegistry,
    tasks: Arc<TaskTable>,
    pool: WorkerPool,
    sweeper: Mutex<Option<SweeperHandle>>,
    shutting_down: AtomicBool,
}

impl AsyncReportController {
    pub fn new(config: ControllerConfig, registry: GeneratorRegistry) -> Self {
        let tasks = Arc::new(TaskTable::default());
        let pool = WorkerPool::new("report-worker", config.max_workers, config.max_queue_size);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sweep_tasks = tasks.clone();
        let sweep_config = config.clone();
        let join = thread::Builder::new()
            .name("report-task-sweeper".to_string())
            .spawn(move || sweeper_loop(sweep_tasks, sweep_config, shutdown_rx))
            .expect("failed to spawn report sweeper thread");

        info!(
            max_workers = config.max_workers.max(1),
            backlog = pool.backlog(),
            task_timeout_secs = config.task_timeout.as_secs(),
            views = ?registry.views(),
            "report controller started"
        );

        Self {
            config,
            registry,
            tasks,
            pool,
            sweeper: Mutex::new(Some(SweeperHandle {
                shutdown: shutdown_tx,
                join: Some(join),
            })),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &GeneratorRegistry {
        &self.registry
    }

    /// Whether `view_name` names a registered generator.
    pub fn is_registered(&self, view_name: &str) -> bool {
        self.registry.resolve(view_name).is_ok()
    }

    /// Submit a report run. Unknown views and a full backlog fail immediately
    /// and leave no task behind.
    pub fn start(&self, view_name: &str, params: ReportParams) -> Result<TaskId, ControllerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ControllerError::ShuttingDown);
        }
        let (view, generator) = self.registry.resolve(view_name)?;
        self.submit(view, generator, params)
    }

    /// Typed form of [`Self::start`].
    pub fn start_view(&self, view: ReportView, params: ReportParams) -> Result<TaskId, ControllerError> {
        self.start(view.as_str(), params)
    }

    fn submit(
        &self,
        view: ReportView,
        generator: ReportGenerator,
        params: ReportParams,
    ) -> Result<TaskId, ControllerError> {
        let id = TaskId::new();
        self.tasks
            .insert(TaskRecord::pending(id, view, params.clone()));

        let tasks = self.tasks.clone();
        let submitted = self
            .pool
            .submit(Box::new(move || run_task(tasks, id, view, params, generator)));

        if let Err(err) = submitted {
            self.tasks.remove(id);
            error!(task_id = %id, view = %view, error = %err, "report task rejected");
            return Err(err);
        }

        info!(task_id = %id, view = %view, "report task submitted");
        Ok(id)
    }

    pub fn progress(&self, id: TaskId) -> Result<TaskProgress, ControllerError> {
        self.tasks.progress(id).ok_or(ControllerError::NotFound(id))
    }

    /// `Some(report)` once completed, `None` while pending, running or after
    /// cancellation, and the stored failure for failed tasks.
    pub fn result(&self, id: TaskId) -> Result<Option<Report>, ControllerError> {
        let (status, result, error) = self.tasks.outcome(id).ok_or(ControllerError::NotFound(id))?;
        match status {
            TaskStatus::Completed => Ok(Some(result.unwrap_or_default())),
            TaskStatus::Failed => Err(ControllerError::TaskFailed(
                error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Cancelled => Ok(None),
        }
    }

    /// Cancel a pending or running task. Returns false for unknown or finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = self.tasks.cancel(id, CANCEL_REASON);
        if cancelled {
            info!(task_id = %id, "report task cancelled");
        }
        cancelled
    }

    /// Task snapshots, newest first.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<TaskSnapshot> {
        self.tasks.list(status, limit)
    }

    pub fn stats(&self) -> ControllerStats {
        let (total_tasks, counts) = self.tasks.status_counts();
        let in_flight = counts
            .iter()
            .filter(|(status, _)| status.is_cancellable())
            .map(|(_, n)| *n)
            .sum();

        ControllerStats {
            total_tasks,
            status_counts: counts
                .into_iter()
                .map(|(status, n)| (status.as_str().to_string(), n))
                .collect(),
            max_workers: self.config.max_workers.max(1),
            max_queue_size: self.pool.backlog(),
            task_timeout_secs: self.config.task_timeout.as_secs(),
            in_flight,
        }
    }

    /// Tasks currently executing.
    pub fn running_count(&self) -> usize {
        self.tasks.count_where(|s| s == TaskStatus::Running)
    }

    /// Tasks accepted and not yet finished (pending plus running).
    pub fn active_count(&self) -> usize {
        self.tasks.count_where(|s| s.is_cancellable())
    }

    /// Run one timeout/retention pass now. Returns the number of deleted tasks.
    pub fn sweep(&self) -> usize {
        self.tasks
            .sweep(self.config.task_timeout, self.config.retention)
            .removed
    }

    /// Stop accepting work, stop the sweep and wait for queued runs to finish.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("report controller shutting down");

        let sweeper = lock_or_recover(&self.sweeper, SOURCE, "shutdown").take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        self.pool.shutdown();

        info!("report controller stopped");
    }
}

impl Drop for AsyncReportController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(
    tasks: Arc<TaskTable>,
    id: TaskId,
    view: ReportView,
    params: ReportParams,
    generator: ReportGenerator,
) {
    if !tasks.begin(id) {
        debug!(task_id = %id, "skipping task cancelled before start");
        return;
    }
    info!(task_id = %id, view = %view, "report task started");

    let handle = TaskHandle::new(id, tasks.clone());
    tasks.advance(id, checkpoint::QUERYING);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| generator(&params, &handle)));

    match outcome {
        Ok(Ok(report)) => {
            if tasks.status(id) != Some(TaskStatus::Running) {
                debug!(task_id = %id, view = %view, "task stopped during generation, result dropped");
                return;
            }
            tasks.advance(id, checkpoint::QUERIED);
            let rows = report.len();
            if tasks.complete(id, report) {
                info!(task_id = %id, view = %view, rows, "report task completed");
            }
        }
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            if tasks.fail(id, message.clone()) {
                error!(task_id = %id, view = %view, error = %message, "report task failed");
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if tasks.fail(id, message.clone()) {
                error!(task_id = %id, view = %view, error = %message, "report generator panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("generator panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("generator panicked: {s}")
    } else {
        "generator panicked".to_string()
    }
}

fn sweeper_loop(tasks: Arc<TaskTable>, config: ControllerConfig, shutdown_rx: mpsc::Receiver<()>) {
    let interval = config.sweep_interval.max(MIN_SWEEP_INTERVAL);
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                tasks.sweep(config.task_timeout, config.retention);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("report sweeper stopped");
}
