//! Cached entries and their read-only metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockview_core::ReportParams;

/// A cached report.
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    pub key: String,
    pub view_name: String,
    pub params: ReportParams,
    pub data: V,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl<V> CachedEntry<V> {
    /// Expired entries are treated as absent even before the sweep removes them.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn info(&self, now: DateTime<Utc>) -> CacheEntryInfo {
        CacheEntryInfo {
            key: self.key.clone(),
            view_name: self.view_name.clone(),
            params: self.params.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            hit_count: self.hit_count,
            last_accessed: self.last_accessed,
            is_expired: self.is_expired_at(now),
        }
    }
}

/// Entry metadata without the payload, for listings and invalidation scans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub view_name: String,
    pub params: ReportParams,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub is_expired: bool,
}
