//! Task records and the read-only views handed to callers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockview_core::{Report, ReportParams, ReportView, TaskId, TaskStatus};

/// Progress checkpoints written by the worker around the generator call.
pub(crate) mod checkpoint {
    pub const STARTED: f64 = 0.1;
    pub const QUERYING: f64 = 0.2;
    /// Generator returned; the result is about to be stored.
    pub const QUERIED: f64 = 0.9;
    /// Highest value a generator may report; 1.0 is reserved for completion.
    pub const GENERATOR_MAX: f64 = 0.95;
    pub const DONE: f64 = 1.0;
}

/// Live state of one controller task.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub view: ReportView,
    pub params: ReportParams,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<Report>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn pending(id: TaskId, view: ReportView, params: ReportParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            view,
            params,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.progress = checkpoint::STARTED;
        self.updated_at = now;
    }

    /// Raise progress; never lowers it and never reaches 1.0.
    pub fn advance(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, checkpoint::GENERATOR_MAX);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = Utc::now();
        }
    }

    pub fn mark_completed(&mut self, report: Report) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.result = Some(report);
        self.progress = checkpoint::DONE;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, message: String) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, reason: String) {
        let now = Utc::now();
        self.status = TaskStatus::Cancelled;
        self.error_message = Some(reason);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn progress_view(&self, now: DateTime<Utc>) -> TaskProgress {
        let (running_seconds, duration_seconds) = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (None, Some(seconds_between(start, end))),
            (Some(start), None) => (Some(seconds_between(start, now)), None),
            _ => (None, None),
        };

        TaskProgress {
            task_id: self.id,
            view_name: self.view,
            status: self.status,
            progress: self.progress,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            running_seconds,
            duration_seconds,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            view_name: self.view,
            params: self.params.clone(),
            status: self.status,
            progress: self.progress,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

/// Answer of [`crate::AsyncReportController::progress`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub view_name: ReportView,
    pub status: TaskStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Elapsed time of a task that is still running
    pub running_seconds: Option<f64>,
    /// Total time of a task that has finished
    pub duration_seconds: Option<f64>,
}

/// One row of [`crate::AsyncReportController::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub view_name: ReportView,
    pub params: ReportParams,
    pub status: TaskStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Controller statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStats {
    pub total_tasks: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub task_timeout_secs: u64,
    /// Pending plus running tasks
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::pending(TaskId::new(), ReportView::SalesReport, ReportParams::new())
    }

    #[test]
    fn progress_never_decreases_and_stays_below_done() {
        let mut r = record();
        r.mark_running();
        r.advance(0.5);
        r.advance(0.3);
        assert_eq!(r.progress, 0.5);
        r.advance(7.0);
        assert_eq!(r.progress, checkpoint::GENERATOR_MAX);

        r.mark_completed(vec![]);
        assert_eq!(r.progress, 1.0);
        assert_eq!(r.status, TaskStatus::Completed);
    }

    #[test]
    fn running_and_duration_seconds_are_exclusive() {
        let mut r = record();
        assert!(r.progress_view(Utc::now()).running_seconds.is_none());

        r.mark_running();
        let running = r.progress_view(Utc::now());
        assert!(running.running_seconds.is_some());
        assert!(running.duration_seconds.is_none());

        r.mark_failed("boom".into());
        let done = r.progress_view(Utc::now());
        assert!(done.running_seconds.is_none());
        assert!(done.duration_seconds.is_some());
        assert_eq!(done.error_message.as_deref(), Some("boom"));
    }
}
