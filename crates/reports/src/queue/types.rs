//! Queue task types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockview_core::{Priority, Report, ReportParams, ReportView, TaskId, TaskStatus};

/// Completion callback, invoked with the queue task id and the report rows.
pub type TaskCallback = Arc<dyn Fn(TaskId, &Report) + Send + Sync>;

/// What to enqueue.
#[derive(Clone)]
pub struct TaskRequest {
    pub view_name: String,
    pub params: ReportParams,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Falls back to the queue's default when unset
    pub max_retries: Option<u32>,
    pub callback: Option<TaskCallback>,
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("view_name", &self.view_name)
            .field("params", &self.params)
            .field("priority", &self.priority)
            .field("scheduled_at", &self.scheduled_at)
            .field("max_retries", &self.max_retries)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl TaskRequest {
    pub fn new(view_name: impl Into<String>, params: ReportParams) -> Self {
        Self {
            view_name: view_name.into(),
            params,
            priority: Priority::Normal,
            scheduled_at: None,
            max_retries: None,
            callback: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TaskId, &Report) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

/// A task owned by the queue.
#[derive(Clone)]
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub view: ReportView,
    pub params: ReportParams,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub callback: Option<TaskCallback>,
    /// Insertion order, breaks ties between equal timestamps
    pub seq: u64,
    pub last_error: Option<String>,
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("priority", &self.priority)
            .field("scheduled_at", &self.scheduled_at)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl QueuedTask {
    pub fn info(
        &self,
        location: TaskLocation,
        status: TaskStatus,
        progress: f64,
    ) -> QueueTaskInfo {
        QueueTaskInfo {
            task_id: self.id,
            view_name: self.view,
            priority: self.priority,
            location,
            status,
            progress,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.last_error.clone(),
        }
    }
}

/// Which queue structure currently holds a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLocation {
    /// Waiting for its `scheduled_at`
    Delayed,
    /// Eligible for dispatch
    Ready,
    /// Handed to the controller
    Running,
    /// Out of retries (or rejected at dispatch)
    Failed,
    /// Completed or cancelled
    Finished,
}

/// Answer of [`crate::TaskQueueManager::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueTaskInfo {
    pub task_id: TaskId,
    pub view_name: ReportView,
    pub priority: Priority,
    pub location: TaskLocation,
    pub status: TaskStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
}

/// Entry of the failed list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub view_name: ReportView,
    pub params: ReportParams,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub delayed: usize,
    pub running: usize,
    pub failed: usize,
    pub max_concurrent_tasks: usize,
    pub max_queue_size: usize,
    /// Ready heap fill, in percent
    pub queue_utilization: f64,
    /// Running tasks against the concurrency ceiling, in percent
    pub concurrent_utilization: f64,
}
