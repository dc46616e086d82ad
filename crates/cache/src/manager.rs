//! TTL + LRU report cache.
//!
//! ## Design
//!
//! - One mutex around an LRU-ordered map; every operation is serialized by it
//! - Expired entries are treated as absent on read (lazy expiry) and removed by
//!   a periodic sweep thread; each physical removal is counted once, by
//!   whichever path finds it first
//! - Values are cloned in and out, so callers never share state with the cache
//! - `get` followed by `set` is not atomic: concurrent misses on the same key
//!   may both run their generator

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use stockview_core::{lock_or_recover, ReportParams};

use crate::config::CacheConfig;
use crate::entry::{CacheEntryInfo, CachedEntry};
use crate::key::cache_key;
use crate::pattern::wildcard_match;

const SOURCE: &str = "cache::manager";

/// Fixed per-entry allowance added to serialized sizes in memory estimates.
const ENTRY_OVERHEAD_BYTES: usize = 1024;

/// Lower bound for the sweep period so a zero interval cannot spin.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Cache statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    /// Hits as a percentage of all `get` calls, rounded to two decimals.
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    total_requests: u64,
}

struct CacheState<V> {
    entries: LruCache<String, CachedEntry<V>>,
    counters: Counters,
}

struct CacheShared<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V> CacheShared<V> {
    fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = lock_or_recover(&self.state, SOURCE, "sweep_expired");
        let state = &mut *guard;

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.pop(key.as_str());
        }
        state.counters.expirations += expired.len() as u64;
        expired.len()
    }
}

#[derive(Debug)]
struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// In-memory report cache keyed by a stable hash of `(view_name, params)`.
pub struct CacheManager<V = Value> {
    shared: Arc<CacheShared<V>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V> core::fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + 'static,
{
    /// Create a cache and start its background expiry sweep.
    pub fn new(config: CacheConfig) -> Self {
        let manager = Self::without_sweeper(config);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let shared = manager.shared.clone();
        let join = thread::Builder::new()
            .name("report-cache-sweeper".to_string())
            .spawn(move || sweeper_loop(shared, shutdown_rx))
            .expect("failed to spawn cache sweeper thread");

        *lock_or_recover(&manager.sweeper, SOURCE, "new") = Some(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        });

        info!(
            max_size = manager.shared.config.capacity(),
            default_ttl_secs = manager.shared.config.default_ttl.as_secs_f64(),
            "report cache initialized"
        );
        manager
    }

    /// Create a cache without the sweep thread (lazy expiry only).
    ///
    /// Expired entries are still hidden from readers; [`Self::sweep_expired`]
    /// can be driven by the caller.
    pub fn without_sweeper(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    counters: Counters::default(),
                }),
                config,
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Derive the cache key of `(view_name, params)`.
    pub fn key(&self, view_name: &str, params: &ReportParams) -> String {
        let key = cache_key(view_name, params);
        debug!(view = view_name, cache_key = %key, "generated cache key");
        key
    }

    /// Look up a live entry, promoting it to most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Utc::now();
        let mut guard = lock_or_recover(&self.shared.state, SOURCE, "get");
        let state = &mut *guard;
        state.counters.total_requests += 1;

        let expired = match state.entries.peek(key) {
            None => {
                state.counters.misses += 1;
                debug!(cache_key = key, "cache miss");
                return None;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            state.entries.pop(key);
            state.counters.misses += 1;
            state.counters.expirations += 1;
            debug!(cache_key = key, "cache entry expired on read");
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.hit_count += 1;
        entry.last_accessed = now;
        let data = entry.data.clone();
        let hit_count = entry.hit_count;
        state.counters.hits += 1;

        debug!(cache_key = key, hit_count, "cache hit");
        Some(data)
    }

    /// Store `data` under `key`, evicting least recently used entries first
    /// when the cache is full. `ttl` defaults to the configured TTL.
    pub fn set(
        &self,
        key: &str,
        view_name: &str,
        params: &ReportParams,
        data: V,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.shared.config.default_ttl);
        let capacity = self.shared.config.capacity();
        let now = Utc::now();

        let mut guard = lock_or_recover(&self.shared.state, SOURCE, "set");
        let state = &mut *guard;

        // Replacing an existing key does not grow the map.
        if !state.entries.contains(key) {
            while state.entries.len() >= capacity {
                match state.entries.pop_lru() {
                    Some((evicted, _)) => {
                        state.counters.evictions += 1;
                        debug!(cache_key = %evicted, "cache full, evicted least recently used entry");
                    }
                    None => break,
                }
            }
        }

        state.entries.put(
            key.to_string(),
            CachedEntry {
                key: key.to_string(),
                view_name: view_name.to_string(),
                params: params.clone(),
                data,
                created_at: now,
                expires_at: expiry(now, ttl),
                hit_count: 0,
                last_accessed: now,
            },
        );

        debug!(cache_key = key, view = view_name, ttl_secs = ttl.as_secs_f64(), "cache entry stored");
    }

    /// Remove every entry whose key or view name matches the wildcard `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut guard = lock_or_recover(&self.shared.state, SOURCE, "invalidate");
        let state = &mut *guard;

        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, entry)| {
                wildcard_match(pattern, key) || wildcard_match(pattern, &entry.view_name)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            state.entries.pop(key.as_str());
        }

        info!(pattern, count = matching.len(), "cache entries invalidated");
        matching.len()
    }

    /// Remove exactly one entry. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        lock_or_recover(&self.shared.state, SOURCE, "remove")
            .entries
            .pop(key)
            .is_some()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) -> usize {
        let mut state = lock_or_recover(&self.shared.state, SOURCE, "clear");
        let count = state.entries.len();
        state.entries.clear();
        info!(count, "report cache cleared");
        count
    }

    /// Number of physically stored entries (expired ones included until swept).
    pub fn len(&self) -> usize {
        lock_or_recover(&self.shared.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock_or_recover(&self.shared.state, SOURCE, "stats");
        let c = &state.counters;
        let hit_rate = if c.total_requests > 0 {
            ((c.hits as f64 / c.total_requests as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        CacheStats {
            size: state.entries.len(),
            max_size: self.shared.config.capacity(),
            hit_rate,
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            expirations: c.expirations,
            total_requests: c.total_requests,
        }
    }

    /// Metadata of up to `limit` entries, most recently accessed first.
    pub fn entries(&self, limit: usize) -> Vec<CacheEntryInfo> {
        let now = Utc::now();
        let state = lock_or_recover(&self.shared.state, SOURCE, "entries");
        state
            .entries
            .iter()
            .take(limit)
            .map(|(_, entry)| entry.info(now))
            .collect()
    }

    /// Metadata of every stored entry, for linear invalidation scans.
    pub fn snapshot(&self) -> Vec<CacheEntryInfo> {
        self.entries(usize::MAX)
    }

    /// Remove entries past their expiry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.shared.sweep_expired()
    }

    /// Stop the sweep thread, if any. The cache stays usable.
    pub fn shutdown(&self) {
        let handle = lock_or_recover(&self.sweeper, SOURCE, "shutdown").take();
        if let Some(handle) = handle {
            handle.stop();
            debug!("report cache sweeper stopped");
        }
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Serialize + 'static,
{
    /// Rough footprint: serialized data and params plus a fixed per-entry overhead.
    pub fn estimated_bytes(&self) -> usize {
        let state = lock_or_recover(&self.shared.state, SOURCE, "estimated_bytes");
        state
            .entries
            .iter()
            .map(|(_, entry)| {
                let data = serde_json::to_vec(&entry.data).map(|b| b.len()).unwrap_or(0);
                let params = serde_json::to_vec(&entry.params).map(|b| b.len()).unwrap_or(0);
                data + params + ENTRY_OVERHEAD_BYTES
            })
            .sum()
    }

    /// [`Self::estimated_bytes`] rendered as `B`, `KB` or `MB`.
    pub fn memory_usage(&self) -> String {
        human_bytes(self.estimated_bytes())
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        let handle = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

fn sweeper_loop<V>(shared: Arc<CacheShared<V>>, shutdown_rx: mpsc::Receiver<()>) {
    let interval = shared.config.cleanup_interval.max(MIN_SWEEP_INTERVAL);

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let removed = shared.sweep_expired();
                if removed > 0 {
                    debug!(count = removed, "swept expired cache entries");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn human_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_size: usize) -> CacheManager {
        CacheManager::without_sweeper(CacheConfig::default().with_max_size(max_size))
    }

    fn params(value: Value) -> ReportParams {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn set_then_get_returns_equal_data() {
        let cache = cache(10);
        let p = params(json!({"start_date": "2024-01-01"}));
        let key = cache.key("inventory_report", &p);
        let data = json!([{"id": 1, "name": "bolt"}, {"id": 2, "name": "nut"}]);

        cache.set(&key, "inventory_report", &p, data.clone(), None);

        assert_eq!(cache.get(&key), Some(data));
    }

    #[test]
    fn mutating_a_returned_value_does_not_touch_the_cache() {
        let cache = cache(10);
        let p = ReportParams::new();
        let key = cache.key("sales_report", &p);
        cache.set(&key, "sales_report", &p, json!([{"qty": 1}]), None);

        let mut first = cache.get(&key).unwrap();
        first[0]["qty"] = json!(999);
        first.as_array_mut().unwrap().push(json!({"qty": 2}));

        assert_eq!(cache.get(&key), Some(json!([{"qty": 1}])));
    }

    #[test]
    fn expired_entry_counts_one_miss_and_one_expiration() {
        let cache = cache(10);
        let p = ReportParams::new();
        let key = cache.key("sales_report", &p);
        cache.set(&key, "sales_report", &p, json!([1]), Some(Duration::from_millis(100)));

        thread::sleep(Duration::from_millis(200));
        let before = cache.stats();
        assert_eq!(cache.get(&key), None);
        let after = cache.stats();

        assert_eq!(after.misses - before.misses, 1);
        assert_eq!(after.expirations - before.expirations, 1);
        assert_eq!(after.size, 0);

        // Already removed: a second read is a plain miss.
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().expirations, after.expirations);
    }

    #[test]
    fn inserting_past_capacity_evicts_the_least_recently_accessed() {
        let cache = cache(3);
        let p = ReportParams::new();
        for key in ["a", "b", "c"] {
            cache.set(key, "inventory_report", &p, json!(key), None);
        }

        // Touch "a" so "b" becomes the least recently used.
        assert!(cache.get("a").is_some());
        cache.set("d", "inventory_report", &p, json!("d"), None);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = cache(2);
        let p = ReportParams::new();
        cache.set("a", "v", &p, json!(1), None);
        cache.set("b", "v", &p, json!(2), None);
        cache.set("a", "v", &p, json!(3), None);

        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(json!(3)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn invalidate_matches_view_name_or_key() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("k1", "supplier_reconciliation", &p, json!(1), None);
        cache.set("k2", "sales_report", &p, json!(2), None);
        cache.set("sales_report_custom", "other", &p, json!(3), None);

        assert_eq!(cache.invalidate("sales_report*"), 2);
        assert!(cache.get("k1").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn hits_update_entry_metadata() {
        let cache = cache(10);
        let p = params(json!({"supplier_name": "Acme"}));
        cache.set("k", "purchase_report", &p, json!([]), None);
        cache.get("k");
        cache.get("k");

        let info = cache.entries(10);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].hit_count, 2);
        assert_eq!(info[0].params, p);
        assert!(!info[0].is_expired);
    }

    #[test]
    fn entries_are_listed_most_recent_first() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("a", "v", &p, json!(1), None);
        cache.set("b", "v", &p, json!(2), None);
        cache.get("a");

        let keys: Vec<String> = cache.entries(10).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.entries(1).len(), 1);
    }

    #[test]
    fn stats_report_hit_rate_as_percentage() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("k", "v", &p, json!(1), None);
        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.hit_rate, 66.67);
    }

    #[test]
    fn sweep_removes_expired_entries_once() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("short", "v", &p, json!(1), Some(Duration::from_millis(20)));
        cache.set("long", "v", &p, json!(2), Some(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.sweep_expired(), 0);
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn background_sweeper_removes_expired_entries() {
        let cache: CacheManager = CacheManager::new(
            CacheConfig::default().with_cleanup_interval(Duration::from_millis(20)),
        );
        let p = ReportParams::new();
        cache.set("k", "v", &p, json!(1), Some(Duration::from_millis(10)));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.len() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
        cache.shutdown();
    }

    #[test]
    fn clear_returns_removed_count() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("a", "v", &p, json!(1), None);
        cache.set("b", "v", &p, json!(2), None);

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_is_exact() {
        let cache = cache(10);
        let p = ReportParams::new();
        cache.set("abc", "v", &p, json!(1), None);
        cache.set("abcd", "v", &p, json!(2), None);

        assert!(cache.remove("abc"));
        assert!(!cache.remove("abc"));
        assert!(cache.get("abcd").is_some());
    }

    #[test]
    fn memory_usage_is_human_readable() {
        let cache = cache(10);
        assert_eq!(cache.memory_usage(), "0 B");

        let p = ReportParams::new();
        cache.set("k", "v", &p, json!([1, 2, 3]), None);
        // "[1,2,3]" + "{}" + overhead
        assert_eq!(cache.estimated_bytes(), 7 + 2 + ENTRY_OVERHEAD_BYTES);
        assert_eq!(cache.memory_usage(), "1.0 KB");
    }

    #[test]
    fn human_bytes_thresholds() {
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
