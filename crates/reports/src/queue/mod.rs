//! Priority and delayed scheduling of report runs, with retry.

mod heap;
mod manager;
mod types;

pub use manager::TaskQueueManager;
pub use types::{FailedTask, QueueStats, QueueTaskInfo, TaskCallback, TaskLocation, TaskRequest};
