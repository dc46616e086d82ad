//! Shared task table.
//!
//! The only place task state changes. Each method takes the lock once, applies
//! one transition and returns; terminal records are never modified again
//! except by the retention sweep, which deletes them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use stockview_core::{lock_or_recover, Report, TaskId, TaskStatus};

use super::types::{TaskProgress, TaskRecord, TaskSnapshot};

const SOURCE: &str = "reports::controller::table";

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepOutcome {
    pub timed_out: usize,
    pub removed: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl TaskTable {
    pub fn insert(&self, record: TaskRecord) {
        lock_or_recover(&self.tasks, SOURCE, "insert").insert(record.id, record);
    }

    pub fn remove(&self, id: TaskId) {
        lock_or_recover(&self.tasks, SOURCE, "remove").remove(&id);
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        lock_or_recover(&self.tasks, SOURCE, "status")
            .get(&id)
            .map(|r| r.status)
    }

    /// Pending -> Running. Returns false if the task was cancelled (or swept)
    /// before a worker picked it up.
    pub fn begin(&self, id: TaskId) -> bool {
        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "begin");
        match tasks.get_mut(&id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.mark_running();
                true
            }
            _ => false,
        }
    }

    /// Raise the progress of a running task.
    pub fn advance(&self, id: TaskId, progress: f64) {
        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "advance");
        if let Some(record) = tasks.get_mut(&id) {
            if record.status == TaskStatus::Running {
                record.advance(progress);
            }
        }
    }

    /// Running -> Completed. A late result for a task that was cancelled or
    /// timed out meanwhile is dropped.
    pub fn complete(&self, id: TaskId, report: Report) -> bool {
        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "complete");
        match tasks.get_mut(&id) {
            Some(record) if record.status == TaskStatus::Running => {
                record.mark_completed(report);
                true
            }
            Some(record) => {
                debug!(task_id = %id, status = %record.status, "discarding late report result");
                false
            }
            None => false,
        }
    }

    /// Running -> Failed.
    pub fn fail(&self, id: TaskId, message: String) -> bool {
        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "fail");
        match tasks.get_mut(&id) {
            Some(record) if record.status == TaskStatus::Running => {
                record.mark_failed(message);
                true
            }
            _ => false,
        }
    }

    /// Pending/Running -> Cancelled.
    pub fn cancel(&self, id: TaskId, reason: &str) -> bool {
        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "cancel");
        match tasks.get_mut(&id) {
            Some(record) if record.status.is_cancellable() => {
                record.mark_cancelled(reason.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn progress(&self, id: TaskId) -> Option<TaskProgress> {
        let now = Utc::now();
        lock_or_recover(&self.tasks, SOURCE, "progress")
            .get(&id)
            .map(|r| r.progress_view(now))
    }

    /// `(status, result, error)` of a task, cloned under the lock.
    pub fn outcome(&self, id: TaskId) -> Option<(TaskStatus, Option<Report>, Option<String>)> {
        lock_or_recover(&self.tasks, SOURCE, "outcome")
            .get(&id)
            .map(|r| (r.status, r.result.clone(), r.error_message.clone()))
    }

    /// Snapshots, newest first.
    pub fn list(&self, filter: Option<TaskStatus>, limit: usize) -> Vec<TaskSnapshot> {
        let tasks = lock_or_recover(&self.tasks, SOURCE, "list");
        let mut rows: Vec<&TaskRecord> = tasks
            .values()
            .filter(|r| filter.is_none_or(|status| r.status == status))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.into_iter().take(limit).map(TaskRecord::snapshot).collect()
    }

    pub fn status_counts(&self) -> (usize, HashMap<TaskStatus, usize>) {
        let tasks = lock_or_recover(&self.tasks, SOURCE, "status_counts");
        let mut counts = HashMap::new();
        for record in tasks.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        (tasks.len(), counts)
    }

    pub fn count_where(&self, pred: impl Fn(TaskStatus) -> bool) -> usize {
        lock_or_recover(&self.tasks, SOURCE, "count_where")
            .values()
            .filter(|r| pred(r.status))
            .count()
    }

    /// Fail running tasks past `timeout`, then delete terminal tasks whose last
    /// update is older than `retention`.
    pub fn sweep(&self, timeout: Duration, retention: Duration) -> SweepOutcome {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut outcome = SweepOutcome::default();

        let mut tasks = lock_or_recover(&self.tasks, SOURCE, "sweep");

        for record in tasks.values_mut() {
            if record.status != TaskStatus::Running {
                continue;
            }
            let Some(started) = record.started_at else {
                continue;
            };
            if now.signed_duration_since(started) > timeout {
                let secs = timeout.num_milliseconds() as f64 / 1000.0;
                record.mark_failed(format!("task timed out after {secs}s"));
                outcome.timed_out += 1;
                warn!(task_id = %record.id, view = %record.view, "report task timed out");
            }
        }

        let before = tasks.len();
        tasks.retain(|_, r| {
            !(r.status.is_terminal() && now.signed_duration_since(r.updated_at) > retention)
        });
        outcome.removed = before - tasks.len();

        if outcome.removed > 0 {
            info!(count = outcome.removed, "expired report tasks removed");
        }
        outcome
    }
}
