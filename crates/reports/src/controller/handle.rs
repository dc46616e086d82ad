use std::sync::Arc;

use stockview_core::{TaskId, TaskStatus};

use super::table::TaskTable;

/// Handed to a report generator while it runs.
///
/// Generators report coarse progress through it and should check
/// [`TaskHandle::is_cancelled`] between expensive steps; the controller never
/// interrupts a running generator.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    table: Arc<TaskTable>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, table: Arc<TaskTable>) -> Self {
        Self { id, table }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Report progress in `[0, 1)`. Lower values than the current one are ignored.
    pub fn set_progress(&self, progress: f64) {
        self.table.advance(self.id, progress);
    }

    /// True once the task stopped being `Running`: cancelled, timed out or swept.
    pub fn is_cancelled(&self) -> bool {
        self.table.status(self.id) != Some(TaskStatus::Running)
    }
}
