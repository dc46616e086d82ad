//! Cache configuration.

use std::time::Duration;

const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Report cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries (clamped to at least 1)
    pub max_size: usize,
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// Period of the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Effective capacity; a zero `max_size` would make every insert evict forever.
    pub fn capacity(&self) -> usize {
        self.max_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(CacheConfig::default().with_max_size(0).capacity(), 1);
    }
}
