//! Bounded-concurrency report execution.

mod executor;
mod handle;
mod pool;
mod table;
mod types;

pub use executor::{AsyncReportController, DEFAULT_LIST_LIMIT};
pub use handle::TaskHandle;
pub use types::{ControllerStats, TaskProgress, TaskSnapshot};
