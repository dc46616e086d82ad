//! `stockview-core`: shared primitives of the reporting subsystem.
//!
//! This crate contains vocabulary types (ids, views, priorities, statuses)
//! plus the lock helper every stateful component shares.

pub mod error;
pub mod id;
pub mod params;
pub mod sync;
pub mod task;
pub mod view;

pub use error::{CoreError, CoreResult};
pub use id::TaskId;
pub use params::{canonical_json, canonical_params, Report, ReportParams};
pub use sync::lock_or_recover;
pub use task::{Priority, TaskStatus};
pub use view::ReportView;
