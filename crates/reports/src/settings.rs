//! Layered settings loading.
//!
//! Precedence, lowest to highest: built-in defaults, `stockview.toml` in the
//! working directory (optional), an explicit file, then `STOCKVIEW__*`
//! environment variables (`STOCKVIEW__CACHE__MAX_SIZE=500`).
//!
//! Durations are either a number of seconds or a string with an `ms` or `s`
//! suffix (`"250ms"`, `"30s"`).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use stockview_cache::CacheConfig;
use stockview_observability::{LogFormat, LoggingSettings};

use crate::config::{ControllerConfig, QueueConfig};

const DEFAULT_CONFIG_BASENAME: &str = "stockview";
const ENV_PREFIX: &str = "STOCKVIEW";

/// Fully validated settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub controller: ControllerConfig,
    pub queue: QueueConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings from the default file, `path` (must exist when given) and
/// the process environment.
pub fn load(path: Option<&Path>) -> Result<Settings, LoadError> {
    load_with_env(path, Environment::with_prefix(ENV_PREFIX))
}

fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(env.separator("__").try_parsing(true));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            controller,
            queue,
            logging,
        } = raw;

        Ok(Self {
            cache: build_cache_config(cache)?,
            controller: build_controller_config(controller)?,
            queue: build_queue_config(queue)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_cache_config(raw: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();
    Ok(CacheConfig {
        max_size: non_zero(raw.max_size, defaults.max_size, "cache.max_size")?,
        default_ttl: duration(raw.default_ttl, defaults.default_ttl, "cache.default_ttl")?,
        cleanup_interval: duration(
            raw.cleanup_interval,
            defaults.cleanup_interval,
            "cache.cleanup_interval",
        )?,
    })
}

fn build_controller_config(raw: RawControllerSettings) -> Result<ControllerConfig, LoadError> {
    let defaults = ControllerConfig::default();
    Ok(ControllerConfig {
        max_workers: non_zero(raw.max_workers, defaults.max_workers, "controller.max_workers")?,
        max_queue_size: non_zero(
            raw.max_queue_size,
            defaults.max_queue_size,
            "controller.max_queue_size",
        )?,
        task_timeout: duration(raw.task_timeout, defaults.task_timeout, "controller.task_timeout")?,
        retention: duration(raw.retention, defaults.retention, "controller.retention")?,
        sweep_interval: duration(
            raw.sweep_interval,
            defaults.sweep_interval,
            "controller.sweep_interval",
        )?,
    })
}

fn build_queue_config(raw: RawQueueSettings) -> Result<QueueConfig, LoadError> {
    let defaults = QueueConfig::default();
    Ok(QueueConfig {
        max_concurrent_tasks: non_zero(
            raw.max_concurrent_tasks,
            defaults.max_concurrent_tasks,
            "queue.max_concurrent_tasks",
        )?,
        max_queue_size: non_zero(raw.max_queue_size, defaults.max_queue_size, "queue.max_queue_size")?,
        retry_delay: duration(raw.retry_delay, defaults.retry_delay, "queue.retry_delay")?,
        default_max_retries: raw.default_max_retries.unwrap_or(defaults.default_max_retries),
        dispatch_interval: duration(
            raw.dispatch_interval,
            defaults.dispatch_interval,
            "queue.dispatch_interval",
        )?,
        promotion_interval: duration(
            raw.promotion_interval,
            defaults.promotion_interval,
            "queue.promotion_interval",
        )?,
        monitor_interval: duration(
            raw.monitor_interval,
            defaults.monitor_interval,
            "queue.monitor_interval",
        )?,
        max_failed_tasks: non_zero(
            raw.max_failed_tasks,
            defaults.max_failed_tasks,
            "queue.max_failed_tasks",
        )?,
        shutdown_timeout: duration(
            raw.shutdown_timeout,
            defaults.shutdown_timeout,
            "queue.shutdown_timeout",
        )?,
    })
}

fn build_logging_settings(raw: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match raw.level {
        Some(level) => LevelFilter::from_str(level.trim()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if raw.json.unwrap_or(true) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn non_zero(value: Option<usize>, default: usize, key: &'static str) -> Result<usize, LoadError> {
    match value {
        Some(0) => Err(LoadError::invalid(key, "must be greater than zero")),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn duration(
    value: Option<RawDuration>,
    default: Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value {
        None => Ok(default),
        Some(RawDuration::Seconds(secs)) => Ok(Duration::from_secs(secs)),
        Some(RawDuration::Text(text)) => {
            parse_duration(&text).map_err(|reason| LoadError::invalid(key, reason))
        }
    }
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (digits, millis) = if let Some(rest) = text.strip_suffix("ms") {
        (rest, true)
    } else if let Some(rest) = text.strip_suffix('s') {
        (rest, false)
    } else {
        (text, false)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("`{text}` is not a duration (expected e.g. `30`, `30s` or `250ms`)"))?;

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    controller: RawControllerSettings,
    queue: RawQueueSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_size: Option<usize>,
    default_ttl: Option<RawDuration>,
    cleanup_interval: Option<RawDuration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawControllerSettings {
    max_workers: Option<usize>,
    max_queue_size: Option<usize>,
    task_timeout: Option<RawDuration>,
    retention: Option<RawDuration>,
    sweep_interval: Option<RawDuration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    max_concurrent_tasks: Option<usize>,
    max_queue_size: Option<usize>,
    retry_delay: Option<RawDuration>,
    default_max_retries: Option<u32>,
    dispatch_interval: Option<RawDuration>,
    promotion_interval: Option<RawDuration>,
    monitor_interval: Option<RawDuration>,
    max_failed_tasks: Option<usize>,
    shutdown_timeout: Option<RawDuration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn defaults_apply_without_sources() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.cache.max_size, 1000);
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(settings.controller.max_workers, 4);
        assert_eq!(settings.queue.max_concurrent_tasks, 5);
        assert_eq!(settings.queue.retry_delay, Duration::from_secs(60));
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        let settings = load_with_env(
            None,
            env(&[
                ("STOCKVIEW__CACHE__MAX_SIZE", "50"),
                ("STOCKVIEW__CACHE__DEFAULT_TTL", "250ms"),
                ("STOCKVIEW__QUEUE__RETRY_DELAY", "5"),
                ("STOCKVIEW__LOGGING__LEVEL", "debug"),
            ]),
        )
        .expect("valid settings");

        assert_eq!(settings.cache.max_size, 50);
        assert_eq!(settings.cache.default_ttl, Duration::from_millis(250));
        assert_eq!(settings.queue.retry_delay, Duration::from_secs(5));
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = load_with_env(None, env(&[("STOCKVIEW__QUEUE__MAX_QUEUE_SIZE", "0")])).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "queue.max_queue_size",
                ..
            }
        ));
    }

    #[test]
    fn malformed_durations_name_the_key() {
        let mut raw = RawSettings::default();
        raw.controller.task_timeout = Some(RawDuration::Text("soon".into()));
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(err.to_string().contains("controller.task_timeout"));
    }

    #[test]
    fn unknown_log_level_is_invalid() {
        let mut raw = RawSettings::default();
        raw.logging.level = Some("chatty".into());
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "logging.level",
                ..
            })
        ));
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration(" 250ms "), Ok(Duration::from_millis(250)));
        assert!(parse_duration("1h").is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_with_env(Some(Path::new("/nonexistent/stockview.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, LoadError::Build(_)));
    }
}
