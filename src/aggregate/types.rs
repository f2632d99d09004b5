use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::model::{Client, ClientType, LineItem, PeriodType, Quote, TrendDirection};

/// Everything the builders read, taken from one read transaction.
/// Soft-deleted rows are included; the builders filter them.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub clients: Vec<Client>,
    pub quotes: Vec<Quote>,
    pub line_items: Vec<LineItem>,
}

/// A materialized aggregate plus the refresh that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<T> {
    pub version: i64,
    pub as_of: DateTime<Utc>,
    pub data: T,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalKpis {
    pub total_quotes: u64,
    pub total_ht: f64,
    pub total_ttc: f64,
    /// Active clients referenced by at least one active quote.
    pub distinct_clients: u64,
    pub thermal_leak_count: u64,
    /// Share of quotes flagged as thermal leaks, one decimal.
    pub thermal_leak_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSegment {
    pub client_type: ClientType,
    pub client_count: u64,
    /// Share of all active clients, one decimal.
    pub client_pct: f64,
    pub revenue_ht: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkCategoryStat {
    /// 1-based position: count descending, then category name ascending.
    pub rank: u32,
    pub category: String,
    pub line_count: u64,
    /// Mean of unit price × quantity.
    pub avg_line_value: f64,
    pub total_ht: f64,
    /// Share of the grand line total, one decimal.
    pub share_pct: f64,
}

/// The three dashboard aggregates produced by one refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSnapshots {
    pub global: GlobalKpis,
    pub segments: Vec<ClientSegment>,
    pub top_categories: Vec<WorkCategoryStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkTypeStat {
    pub category: String,
    pub period_type: PeriodType,
    pub period_date: NaiveDate,
    /// Active quotes in the period with at least one line in this category.
    pub quote_count: u64,
    pub line_count: u64,
    pub total_ht: f64,
    pub avg_line_ht: f64,
    /// Change of `total_ht` against the previous period, one decimal.
    pub evolution_pct: f64,
    pub trend: TrendDirection,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStat {
    pub region: String,
    pub period_type: PeriodType,
    pub period_date: NaiveDate,
    pub quote_count: u64,
    pub accepted_count: u64,
    pub total_ht: f64,
    pub avg_quote_ht: f64,
    pub conversion_rate: f64,
    pub evolution_pct: f64,
    pub trend: TrendDirection,
    pub updated_at: DateTime<Utc>,
}
