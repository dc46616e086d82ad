//! Tracing/logging initialization.
//!
//! JSON or compact output, filtered by `RUST_LOG` when set and by the
//! configured level otherwise.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Logging settings (level + format).
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        }
    }
}

impl LoggingSettings {
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). Returns `false`
/// when a global subscriber was already installed.
pub fn init(settings: &LoggingSettings) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(settings.level.into())
        .from_env_lossy();

    let installed = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(true)
            .try_init(),
    };

    match installed {
        Ok(()) => {
            ::tracing::info!(
                level = %settings.level,
                format = ?settings.format,
                "logging initialized"
            );
            true
        }
        Err(_) => {
            ::tracing::debug!("global subscriber already installed, keeping it");
            false
        }
    }
}
