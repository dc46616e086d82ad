use std::fmt::Display;
use std::time::Duration;

use tracing::error;

use stockview_core::ReportParams;

use crate::manager::CacheManager;

/// Read-through helper: return the cached report for `(view_name, params)` or
/// run `generator`, store its output and return it unchanged.
///
/// Generator errors are logged and returned as-is; nothing is cached for them.
pub fn cache_report_data<V, E, F>(
    cache: &CacheManager<V>,
    view_name: &str,
    params: &ReportParams,
    ttl: Option<Duration>,
    generator: F,
) -> Result<V, E>
where
    V: Clone + Send + 'static,
    E: Display,
    F: FnOnce() -> Result<V, E>,
{
    let key = cache.key(view_name, params);
    if let Some(cached) = cache.get(&key) {
        return Ok(cached);
    }

    match generator() {
        Ok(data) => {
            cache.set(&key, view_name, params, data.clone(), ttl);
            Ok(data)
        }
        Err(err) => {
            error!(view = view_name, error = %err, "report generation failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use serde_json::{json, Value};
    use std::cell::Cell;

    #[test]
    fn generator_runs_once_then_hits() {
        let cache: CacheManager = CacheManager::without_sweeper(CacheConfig::default());
        let params = ReportParams::new();
        let calls = Cell::new(0);
        let generate = || -> Result<Value, String> {
            calls.set(calls.get() + 1);
            Ok(json!([{"sku": "A-1"}, {"sku": "A-2"}]))
        };

        let first = cache_report_data(&cache, "inventory_report", &params, None, generate).unwrap();
        let second = cache_report_data(&cache, "inventory_report", &params, None, generate).unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn errors_propagate_and_are_not_cached() {
        let cache: CacheManager = CacheManager::without_sweeper(CacheConfig::default());
        let params = ReportParams::new();

        let err = cache_report_data(&cache, "sales_report", &params, None, || {
            Err::<Value, _>("query failed".to_string())
        })
        .unwrap_err();

        assert_eq!(err, "query failed");
        assert!(cache.is_empty());
    }
}
