//! Aggregate Builder: dashboard snapshots and trend rollups.
//!
//! The builders are pure functions over a [`StoreSnapshot`]; loading the
//! snapshot (one read transaction) and persisting the results are the
//! caller's job, see [`crate::refresh`].

pub mod types;

pub use types::*;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::guard;
use crate::metrics::{rate_pct, round_to};
use crate::model::{region_of, ClientType, QuoteStatus, TrendDirection};
use crate::query::period::Period;
use crate::storage::repository;

/// Load every row the builders need. Call inside a single read transaction
/// so all builders of one refresh see the same state.
pub fn load_store_snapshot(conn: &Connection) -> Result<StoreSnapshot> {
    Ok(StoreSnapshot {
        clients: repository::list_clients(conn, true)?,
        quotes: repository::list_quotes(conn, true)?,
        line_items: repository::list_all_line_items(conn)?,
    })
}

// ── Dashboard snapshots ────────────────────────────────────────────

pub fn build_global_kpis(snapshot: &StoreSnapshot) -> GlobalKpis {
    let active_clients: HashSet<i64> = guard::active(&snapshot.clients).map(|c| c.id).collect();

    let mut kpis = GlobalKpis::default();
    let mut referenced = HashSet::new();
    for q in guard::active(&snapshot.quotes) {
        kpis.total_quotes += 1;
        kpis.total_ht += q.total_ht;
        kpis.total_ttc += q.total_ttc;
        if q.is_thermal_leak {
            kpis.thermal_leak_count += 1;
        }
        if let Some(id) = q.client_id.filter(|id| active_clients.contains(id)) {
            referenced.insert(id);
        }
    }

    kpis.total_ht = round_to(kpis.total_ht, 2);
    kpis.total_ttc = round_to(kpis.total_ttc, 2);
    kpis.distinct_clients = referenced.len() as u64;
    kpis.thermal_leak_pct = rate_pct(kpis.thermal_leak_count as f64, kpis.total_quotes as f64, 1);
    kpis
}

/// One row per client type that has at least one active client, in
/// [`ClientType::ALL`] order. Revenue only counts active quotes owned by
/// active clients; quotes whose client was cleared are not attributed.
pub fn build_client_segments(snapshot: &StoreSnapshot) -> Vec<ClientSegment> {
    let mut type_of: HashMap<i64, ClientType> = HashMap::new();
    let mut counts: HashMap<ClientType, u64> = HashMap::new();
    for c in guard::active(&snapshot.clients) {
        type_of.insert(c.id, c.client_type);
        *counts.entry(c.client_type).or_default() += 1;
    }

    let mut revenue: HashMap<ClientType, f64> = HashMap::new();
    for q in guard::active(&snapshot.quotes) {
        if let Some(ct) = q.client_id.and_then(|id| type_of.get(&id)) {
            *revenue.entry(*ct).or_default() += q.total_ht;
        }
    }

    let total_clients = type_of.len() as f64;
    ClientType::ALL
        .iter()
        .filter_map(|ct| {
            let count = *counts.get(ct)?;
            Some(ClientSegment {
                client_type: *ct,
                client_count: count,
                client_pct: rate_pct(count as f64, total_clients, 1),
                revenue_ht: round_to(revenue.get(ct).copied().unwrap_or(0.0), 2),
            })
        })
        .collect()
}

/// Every category used by an active quote, ranked by line count descending
/// then category name ascending.
pub fn build_top_categories(snapshot: &StoreSnapshot) -> Vec<WorkCategoryStat> {
    #[derive(Default)]
    struct Acc {
        count: u64,
        value: f64,
        total: f64,
    }

    let active_quotes: HashSet<i64> = guard::active(&snapshot.quotes).map(|q| q.id).collect();

    let mut by_category: HashMap<&str, Acc> = HashMap::new();
    for line in snapshot
        .line_items
        .iter()
        .filter(|l| active_quotes.contains(&l.quote_id))
    {
        let acc = by_category.entry(line.category.as_str()).or_default();
        acc.count += 1;
        acc.value += line.unit_price_ht * line.quantity;
        acc.total += line.total_ht;
    }

    let grand_total: f64 = by_category.values().map(|a| a.total).sum();

    let mut rows: Vec<(&str, Acc)> = by_category.into_iter().collect();
    rows.sort_by(|(a_name, a), (b_name, b)| b.count.cmp(&a.count).then_with(|| a_name.cmp(b_name)));

    rows.into_iter()
        .enumerate()
        .map(|(i, (category, acc))| WorkCategoryStat {
            rank: i as u32 + 1,
            category: category.to_string(),
            line_count: acc.count,
            avg_line_value: round_to(acc.value / acc.count as f64, 2),
            total_ht: round_to(acc.total, 2),
            share_pct: rate_pct(acc.total, grand_total, 1),
        })
        .collect()
}

/// The three dashboard snapshots, in refresh order.
pub fn build_dashboard(snapshot: &StoreSnapshot) -> DashboardSnapshots {
    DashboardSnapshots {
        global: build_global_kpis(snapshot),
        segments: build_client_segments(snapshot),
        top_categories: build_top_categories(snapshot),
    }
}

// ── Trend rollups ──────────────────────────────────────────────────

/// Change from `previous` to `current` in percent, one decimal. 0 when there
/// is nothing to compare against.
pub fn evolution_pct(current: f64, previous: f64) -> f64 {
    rate_pct(current - previous, previous, 1)
}

/// `Stable` when the change stays within `±band` percent. Without a previous
/// value any positive amount is a rise.
pub fn trend_direction(current: f64, previous: f64, band: f64) -> TrendDirection {
    if previous == 0.0 {
        return if current > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Stable
        };
    }
    let change = (current - previous) * 100.0 / previous;
    if change.abs() <= band {
        TrendDirection::Stable
    } else if change > 0.0 {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    }
}

#[derive(Default)]
struct WorkTypeAcc {
    quotes: BTreeSet<i64>,
    lines: u64,
    total: f64,
}

fn work_type_totals(snapshot: &StoreSnapshot, period: &Period) -> BTreeMap<String, WorkTypeAcc> {
    let in_period: HashSet<i64> = guard::active(&snapshot.quotes)
        .filter(|q| period.contains(q.quote_date))
        .map(|q| q.id)
        .collect();

    let mut out: BTreeMap<String, WorkTypeAcc> = BTreeMap::new();
    for line in snapshot
        .line_items
        .iter()
        .filter(|l| in_period.contains(&l.quote_id))
    {
        let acc = out.entry(line.category.clone()).or_default();
        acc.quotes.insert(line.quote_id);
        acc.lines += 1;
        acc.total += line.total_ht;
    }
    out
}

/// One row per category seen in `period` or the period before it. A
/// category that disappeared gets a zero row trending down.
pub fn build_work_type_stats(
    snapshot: &StoreSnapshot,
    period: &Period,
    now: DateTime<Utc>,
    stable_band: f64,
) -> Vec<WorkTypeStat> {
    let current = work_type_totals(snapshot, period);
    let previous = work_type_totals(snapshot, &period.previous());

    let categories: BTreeSet<&String> = current.keys().chain(previous.keys()).collect();
    let empty = WorkTypeAcc::default();

    categories
        .into_iter()
        .map(|category| {
            let cur = current.get(category).unwrap_or(&empty);
            let prev_total = previous.get(category).map(|a| a.total).unwrap_or(0.0);
            WorkTypeStat {
                category: category.clone(),
                period_type: period.period_type(),
                period_date: period.period_date(),
                quote_count: cur.quotes.len() as u64,
                line_count: cur.lines,
                total_ht: round_to(cur.total, 2),
                avg_line_ht: if cur.lines == 0 {
                    0.0
                } else {
                    round_to(cur.total / cur.lines as f64, 2)
                },
                evolution_pct: evolution_pct(cur.total, prev_total),
                trend: trend_direction(cur.total, prev_total, stable_band),
                updated_at: now,
            }
        })
        .collect()
}

#[derive(Default)]
struct RegionAcc {
    quotes: u64,
    accepted: u64,
    total: f64,
}

fn region_totals(snapshot: &StoreSnapshot, period: &Period) -> BTreeMap<String, RegionAcc> {
    let mut out: BTreeMap<String, RegionAcc> = BTreeMap::new();
    for q in guard::active(&snapshot.quotes).filter(|q| period.contains(q.quote_date)) {
        let acc = out
            .entry(region_of(q.site_postal_code.as_deref()))
            .or_default();
        acc.quotes += 1;
        if q.status == QuoteStatus::Accepted {
            acc.accepted += 1;
        }
        acc.total += q.total_ht;
    }
    out
}

/// One row per region seen in `period` or the period before it.
pub fn build_region_stats(
    snapshot: &StoreSnapshot,
    period: &Period,
    now: DateTime<Utc>,
    stable_band: f64,
) -> Vec<RegionStat> {
    let current = region_totals(snapshot, period);
    let previous = region_totals(snapshot, &period.previous());

    let regions: BTreeSet<&String> = current.keys().chain(previous.keys()).collect();
    let empty = RegionAcc::default();

    regions
        .into_iter()
        .map(|region| {
            let cur = current.get(region).unwrap_or(&empty);
            let prev_total = previous.get(region).map(|a| a.total).unwrap_or(0.0);
            RegionStat {
                region: region.clone(),
                period_type: period.period_type(),
                period_date: period.period_date(),
                quote_count: cur.quotes,
                accepted_count: cur.accepted,
                total_ht: round_to(cur.total, 2),
                avg_quote_ht: if cur.quotes == 0 {
                    0.0
                } else {
                    round_to(cur.total / cur.quotes as f64, 2)
                },
                conversion_rate: rate_pct(cur.accepted as f64, cur.quotes as f64, 2),
                evolution_pct: evolution_pct(cur.total, prev_total),
                trend: trend_direction(cur.total, prev_total, stable_band),
                updated_at: now,
            }
        })
        .collect()
}
