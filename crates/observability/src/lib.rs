//! Tracing and logging (shared setup).
//!
//! Library crates only emit through the `tracing` facade; binaries and tests
//! call one of the initializers below.

/// Tracing configuration (filters, format).
pub mod tracing;

pub use tracing::{LogFormat, LoggingSettings};

/// Initialize process-wide observability with explicit settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(settings: &LoggingSettings) -> bool {
    tracing::init(settings)
}

/// Initialize with defaults (JSON, `info`, overridable through `RUST_LOG`).
pub fn init_default() -> bool {
    tracing::init(&LoggingSettings::default())
}
