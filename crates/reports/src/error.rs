//! Error types of the task subsystem.

use core::fmt;

use thiserror::Error;

use stockview_core::TaskId;

/// Errors returned by [`crate::AsyncReportController`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// No generator is registered under this view name.
    #[error("unknown report view: {0}")]
    UnknownView(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Every worker is busy and the backlog is full.
    #[error("worker backlog is full (capacity {capacity})")]
    BacklogFull { capacity: usize },

    #[error("report controller is shutting down")]
    ShuttingDown,

    /// The task failed; carries the stored failure message.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// Which heap rejected an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Ready,
    Delayed,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Ready => f.write_str("ready"),
            QueueKind::Delayed => f.write_str("delayed"),
        }
    }
}

/// Errors returned by [`crate::TaskQueueManager`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("{queue} queue is full (capacity {capacity})")]
    CapacityExceeded { queue: QueueKind, capacity: usize },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("unknown report view: {0}")]
    UnknownView(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("task queue is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Controller(#[from] ControllerError),
}
