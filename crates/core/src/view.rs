//! Report view catalogue.
//!
//! A view name is both the cache namespace of a report and the key its
//! generator is registered under. Callers hand us strings (CLI scripts, the
//! front-end), so parsing is the single place an unknown name is rejected.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Logical report type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportView {
    SupplierReconciliation,
    CustomerReconciliation,
    InventoryReport,
    SalesReport,
    PurchaseReport,
    PayablesReport,
    ReceivablesReport,
}

impl ReportView {
    pub const ALL: [ReportView; 7] = [
        ReportView::SupplierReconciliation,
        ReportView::CustomerReconciliation,
        ReportView::InventoryReport,
        ReportView::SalesReport,
        ReportView::PurchaseReport,
        ReportView::PayablesReport,
        ReportView::ReceivablesReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportView::SupplierReconciliation => "supplier_reconciliation",
            ReportView::CustomerReconciliation => "customer_reconciliation",
            ReportView::InventoryReport => "inventory_report",
            ReportView::SalesReport => "sales_report",
            ReportView::PurchaseReport => "purchase_report",
            ReportView::PayablesReport => "payables_report",
            ReportView::ReceivablesReport => "receivables_report",
        }
    }
}

impl core::fmt::Display for ReportView {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportView {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportView::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CoreError::unknown_view(s))
    }
}
