//! Write-path cache invalidation.
//!
//! Maps a mutated collection to the report views that read it and evicts
//! those views from the shared [`CacheManager`]. Every entry point swallows
//! its own faults and reports `0`, so a write never fails because of the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockview_core::{ReportParams, ReportView};

use crate::entry::CacheEntryInfo;
use crate::manager::{CacheManager, CacheStats};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Kind of write that triggered an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
}

impl WriteOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Master-data entity whose changes ripple into cached reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Supplier,
    Customer,
}

impl EntityKind {
    /// Report parameter naming this entity.
    pub fn param_key(self) -> &'static str {
        match self {
            Self::Supplier => "supplier_name",
            Self::Customer => "customer_name",
        }
    }

    /// Views that aggregate over every entity of this kind.
    pub fn dependent_views(self) -> &'static [ReportView] {
        match self {
            Self::Supplier => &[ReportView::SupplierReconciliation, ReportView::PurchaseReport],
            Self::Customer => &[ReportView::CustomerReconciliation, ReportView::SalesReport],
        }
    }
}

/// Static `collection -> dependent views` table.
#[derive(Debug, Clone, Copy)]
pub struct InvalidationRules {
    rules: &'static [(&'static str, &'static [ReportView])],
}

const DEFAULT_RULES: &[(&str, &[ReportView])] = &[
    (
        "purchase_inbound",
        &[
            ReportView::SupplierReconciliation,
            ReportView::PurchaseReport,
            ReportView::InventoryReport,
        ],
    ),
    ("payment_details", &[ReportView::SupplierReconciliation]),
    (
        "sales_outbound",
        &[
            ReportView::CustomerReconciliation,
            ReportView::SalesReport,
            ReportView::InventoryReport,
        ],
    ),
    ("receipt_details", &[ReportView::CustomerReconciliation]),
    ("inventory_stats", &[ReportView::InventoryReport]),
    (
        "suppliers",
        &[ReportView::SupplierReconciliation, ReportView::PurchaseReport],
    ),
    (
        "customers",
        &[ReportView::CustomerReconciliation, ReportView::SalesReport],
    ),
];

impl Default for InvalidationRules {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES,
        }
    }
}

impl InvalidationRules {
    pub fn new(rules: &'static [(&'static str, &'static [ReportView])]) -> Self {
        Self { rules }
    }

    /// Views depending on `collection`; empty for unmapped collections.
    pub fn views_for(&self, collection: &str) -> &'static [ReportView] {
        self.rules
            .iter()
            .find(|(name, _)| *name == collection)
            .map(|(_, views)| *views)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Distinct views referenced by any rule.
    pub fn distinct_views(&self) -> BTreeSet<ReportView> {
        self.rules
            .iter()
            .flat_map(|(_, views)| views.iter().copied())
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        self.rules
            .iter()
            .map(|(name, views)| {
                (
                    name.to_string(),
                    views.iter().map(|v| v.as_str().to_string()).collect(),
                )
            })
            .collect()
    }
}

/// Snapshot of the invalidation layer.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationStats {
    pub cache_stats: CacheStats,
    pub rules: BTreeMap<String, Vec<String>>,
    pub total_rules: usize,
    pub total_views: usize,
}

#[derive(Debug, Error)]
enum DateBoundError {
    #[error("{field} is not a string")]
    NotAString { field: &'static str },

    #[error("{field} is not a YYYY-MM-DD date: {value}")]
    Unparseable {
        field: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Evicts cached reports when the data behind them changes.
#[derive(Debug)]
pub struct CacheInvalidationManager<V = Value> {
    cache: Arc<CacheManager<V>>,
    rules: InvalidationRules,
}

impl<V> CacheInvalidationManager<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(cache: Arc<CacheManager<V>>) -> Self {
        Self::with_rules(cache, InvalidationRules::default())
    }

    pub fn with_rules(cache: Arc<CacheManager<V>>, rules: InvalidationRules) -> Self {
        Self { cache, rules }
    }

    pub fn cache(&self) -> &Arc<CacheManager<V>> {
        &self.cache
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    /// Evict every view that reads `collection`. Unmapped collections are a no-op.
    pub fn invalidate_by_collection(&self, collection: &str, operation: WriteOperation) -> usize {
        guarded("invalidate_by_collection", || {
            let views = self.rules.views_for(collection);
            if views.is_empty() {
                debug!(collection, operation = %operation, "no invalidation rule for collection");
                return 0;
            }

            let mut total = 0;
            for view in views {
                let count = self.cache.invalidate(&format!("{}*", view.as_str()));
                debug!(collection, view = %view, count, "view cache invalidated");
                total += count;
            }

            info!(collection, operation = %operation, count = total, "collection change invalidated cache");
            total
        })
    }

    /// Evict one view's entries.
    pub fn invalidate_by_view(&self, view_name: &str) -> usize {
        guarded("invalidate_by_view", || {
            let count = self.cache.invalidate(&format!("{view_name}*"));
            info!(view = view_name, count, "view cache invalidated");
            count
        })
    }

    /// Evict entries filtered on `value` plus every view aggregating over `kind`.
    pub fn invalidate_by_entity(&self, kind: EntityKind, value: &str) -> usize {
        guarded("invalidate_by_entity", || {
            let dependent = kind.dependent_views();
            let count = self.remove_where(|entry| {
                entry.params.get(kind.param_key()).and_then(Value::as_str) == Some(value)
                    || dependent.iter().any(|v| v.as_str() == entry.view_name)
            });
            info!(entity = kind.param_key(), value, count, "entity cache invalidated");
            count
        })
    }

    /// Evict entries whose `start_date`/`end_date` window overlaps `[start, end]`.
    ///
    /// Missing bounds are open. Entries without any date bound, or with bounds
    /// that cannot be parsed, are treated as overlapping.
    pub fn invalidate_by_date_range(&self, start: Option<&str>, end: Option<&str>) -> usize {
        guarded("invalidate_by_date_range", || {
            let count = self.remove_where(|entry| date_ranges_overlap(start, end, &entry.params));
            info!(start, end, count, "date range cache invalidated");
            count
        })
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            cache_stats: self.cache.stats(),
            rules: self.rules.to_map(),
            total_rules: self.rules.len(),
            total_views: self.rules.distinct_views().len(),
        }
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntryInfo) -> bool) -> usize {
        self.cache
            .snapshot()
            .iter()
            .filter(|entry| predicate(*entry))
            .filter(|entry| self.cache.remove(&entry.key))
            .count()
    }
}

fn guarded(op: &'static str, f: impl FnOnce() -> usize) -> usize {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(count) => count,
        Err(_) => {
            error!(op, "cache invalidation failed");
            0
        }
    }
}

fn date_ranges_overlap(start: Option<&str>, end: Option<&str>, params: &ReportParams) -> bool {
    let cached_start = params.get("start_date");
    let cached_end = params.get("end_date");
    if is_blank(cached_start) && is_blank(cached_end) {
        return true;
    }

    let bounds = (|| -> Result<_, DateBoundError> {
        Ok((
            parse_str_bound("start", start)?.unwrap_or(NaiveDate::MIN),
            parse_str_bound("end", end)?.unwrap_or(NaiveDate::MAX),
            parse_value_bound("start_date", cached_start)?.unwrap_or(NaiveDate::MIN),
            parse_value_bound("end_date", cached_end)?.unwrap_or(NaiveDate::MAX),
        ))
    })();

    match bounds {
        Ok((start, end, cached_start, cached_end)) => !(end < cached_start || cached_end < start),
        Err(err) => {
            warn!(error = %err, "unreadable date bound, treating as overlapping");
            true
        }
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn parse_str_bound(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<NaiveDate>, DateBoundError> {
    match value {
        None | Some("") => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(Some)
            .map_err(|source| DateBoundError::Unparseable {
                field,
                value: raw.to_string(),
                source,
            }),
    }
}

fn parse_value_bound(
    field: &'static str,
    value: Option<&Value>,
) -> Result<Option<NaiveDate>, DateBoundError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => parse_str_bound(field, Some(raw)),
        Some(_) => Err(DateBoundError::NotAString { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use serde_json::json;

    fn params(value: Value) -> ReportParams {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn manager() -> CacheInvalidationManager {
        CacheInvalidationManager::new(Arc::new(CacheManager::without_sweeper(
            CacheConfig::default(),
        )))
    }

    fn seed(manager: &CacheInvalidationManager, view: &str, p: Value) -> String {
        let p = params(p);
        let key = manager.cache().key(view, &p);
        manager.cache().set(&key, view, &p, json!([]), None);
        key
    }

    #[test]
    fn purchase_inbound_evicts_supplier_side_views_only() {
        let m = manager();
        seed(&m, "supplier_reconciliation", json!({}));
        seed(&m, "purchase_report", json!({}));
        seed(&m, "inventory_report", json!({}));
        let customer = seed(&m, "customer_reconciliation", json!({}));

        assert_eq!(m.invalidate_by_collection("purchase_inbound", WriteOperation::Insert), 3);
        assert_eq!(m.cache().len(), 1);
        assert!(m.cache().get(&customer).is_some());
    }

    #[test]
    fn unmapped_collection_is_a_no_op() {
        let m = manager();
        seed(&m, "sales_report", json!({}));
        assert_eq!(m.invalidate_by_collection("materials", WriteOperation::Update), 0);
        assert_eq!(m.cache().len(), 1);
    }

    #[test]
    fn invalidate_by_view_passes_through() {
        let m = manager();
        seed(&m, "sales_report", json!({"start_date": "2024-01-01"}));
        seed(&m, "sales_report", json!({"start_date": "2024-02-01"}));
        seed(&m, "purchase_report", json!({}));

        assert_eq!(m.invalidate_by_view("sales_report"), 2);
        assert_eq!(m.cache().len(), 1);
    }

    #[test]
    fn supplier_invalidation_matches_param_and_dependent_views() {
        let m = manager();
        seed(&m, "payables_report", json!({"supplier_name": "Acme"}));
        seed(&m, "payables_report", json!({"supplier_name": "Other"}));
        seed(&m, "purchase_report", json!({}));
        seed(&m, "customer_reconciliation", json!({"customer_name": "Acme"}));

        assert_eq!(m.invalidate_by_entity(EntityKind::Supplier, "Acme"), 2);
        assert_eq!(m.cache().len(), 2);
    }

    #[test]
    fn customer_invalidation_uses_customer_name() {
        let m = manager();
        seed(&m, "receivables_report", json!({"customer_name": "Beta"}));
        seed(&m, "receivables_report", json!({"customer_name": "Gamma"}));

        assert_eq!(m.invalidate_by_entity(EntityKind::Customer, "Beta"), 1);
        assert_eq!(m.cache().len(), 1);
    }

    #[test]
    fn date_range_evicts_overlapping_and_undated_entries() {
        let m = manager();
        seed(&m, "sales_report", json!({"start_date": "2024-01-01", "end_date": "2024-01-31"}));
        seed(&m, "sales_report", json!({"start_date": "2024-03-01", "end_date": "2024-03-31"}));
        seed(&m, "inventory_report", json!({}));
        let kept = seed(&m, "purchase_report", json!({"end_date": "2023-12-31"}));

        assert_eq!(m.invalidate_by_date_range(Some("2024-01-15"), Some("2024-02-15")), 2);
        assert!(m.cache().get(&kept).is_some());
    }

    #[test]
    fn unparseable_dates_are_treated_as_overlapping() {
        let p = params(json!({"start_date": "01/02/2024"}));
        assert!(date_ranges_overlap(Some("2030-01-01"), None, &p));

        let p = params(json!({"start_date": 20240101}));
        assert!(date_ranges_overlap(Some("2030-01-01"), None, &p));

        let p = params(json!({"start_date": "2024-01-01"}));
        assert!(date_ranges_overlap(Some("garbage"), None, &p));
    }

    #[test]
    fn open_bounds_on_both_sides() {
        let p = params(json!({"start_date": "2024-06-01"}));
        assert!(date_ranges_overlap(None, Some("2024-06-01"), &p));
        assert!(!date_ranges_overlap(None, Some("2024-05-31"), &p));
    }

    #[test]
    fn stats_describe_the_rule_table() {
        let m = manager();
        let stats = m.stats();
        assert_eq!(stats.total_rules, 7);
        assert_eq!(stats.total_views, 5);
        assert_eq!(
            stats.rules["payment_details"],
            vec!["supplier_reconciliation".to_string()]
        );
    }

    #[test]
    fn faults_are_reported_as_zero() {
        assert_eq!(guarded("test", || panic!("boom")), 0);
    }
}
