//! `stockview-reports`: asynchronous report execution and scheduling.
//!
//! - [`AsyncReportController`]: bounded worker pool running registered
//!   generators, with progress, cancellation, timeout and retention
//! - [`TaskQueueManager`]: priority and delayed scheduling with retry in front
//!   of the controller
//! - [`ReportingContext`]: one of everything, built from [`Settings`]

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod queue;
pub mod registry;
pub mod settings;


pub use config::{ControllerConfig, QueueConfig};
pub use context::{invalidate_cache_on_data_change, ReportingContext};
pub use controller::{
    AsyncReportController, ControllerStats, TaskHandle, TaskProgress, TaskSnapshot,
    DEFAULT_LIST_LIMIT,
};
pub use error::{ControllerError, QueueError, QueueKind};
pub use queue::{
    FailedTask, QueueStats, QueueTaskInfo, TaskCallback, TaskLocation, TaskQueueManager,
    TaskRequest,
};
pub use registry::{GeneratorRegistry, ReportGenerator};
pub use settings::{load as load_settings, LoadError, Settings};
