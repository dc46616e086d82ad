//! `stockview-cache`: in-memory report cache and its write-path invalidation.
//!
//! - [`CacheManager`]: TTL + LRU store keyed by a hash of `(view, params)`
//! - [`cache_report_data`]: read-through population helper
//! - [`CacheInvalidationManager`]: maps collection writes to evicted views

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod manager;
pub mod pattern;
pub mod populate;

pub use config::CacheConfig;
pub use entry::{CacheEntryInfo, CachedEntry};
pub use invalidation::{
    CacheInvalidationManager, EntityKind, InvalidationRules, InvalidationStats, WriteOperation,
};
pub use key::cache_key;
pub use manager::{CacheManager, CacheStats};
pub use pattern::wildcard_match;
pub use populate::cache_report_data;
