pub mod aggregate;
pub mod config;
pub mod date_util;
pub mod error;
pub mod guard;
pub mod load;
pub mod metrics;
pub mod model;
pub mod query;
pub mod refresh;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use aggregate::{
    ClientSegment, DashboardSnapshots, GlobalKpis, RegionStat, Snapshot, WorkCategoryStat,
    WorkTypeStat,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use load::{ImportBatch, ImportReport};
pub use metrics::{ClientMetrics, ClientMetricsReport};
pub use model::{
    Client, ClientPatch, ClientType, EnergyRating, LineItem, NewClient, NewLineItem, NewPayment,
    NewQuote, NewWorkArea, Payment, PaymentMethod, PaymentStatus, PeriodType, Quote, QuotePatch,
    QuoteStatus, TrendDirection, WorkArea,
};
pub use query::builder::{QuoteQuery, QuoteRow};
pub use query::period::Period;
pub use refresh::{
    RefreshCoordinator, RefreshLease, RefreshReport, RefreshScheduler, RefreshStatus,
    TrendRefreshReport, Watermark,
};
pub use storage::repository::StoreCounts;
pub use storage::Database;

use chrono::NaiveDate;
use serde::Serialize;

use storage::repository;

/// Engine state for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub counts: StoreCounts,
    pub watermark: Option<Watermark>,
    /// True while this process or another one sharing the file is refreshing.
    pub refresh_running: bool,
    pub lease: Option<RefreshLease>,
    pub config: EngineConfig,
}

/// Main entry point for the estimate statistics engine.
pub struct EstimateDW {
    db: Database,
    coordinator: RefreshCoordinator,
}

impl EstimateDW {
    pub fn new(db: Database) -> Self {
        let coordinator = RefreshCoordinator::new(db.clone());
        Self { db, coordinator }
    }

    /// Open the database at `path`, or the default location.
    pub async fn open(path: Option<&std::path::Path>) -> Result<Self> {
        let db = match path {
            Some(p) => Database::open_at(p).await?,
            None => Database::open().await?,
        };
        Ok(Self::new(db))
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    // ── Derived reads ────────────────────────────────────────────

    pub async fn get_client_metrics(&self, client_id: i64) -> Result<ClientMetricsReport> {
        metrics::get_client_metrics(&self.db, client_id).await
    }

    /// Global KPIs as of the last refresh.
    pub async fn get_global_kpis(&self) -> Result<Snapshot<GlobalKpis>> {
        self.db
            .read(|conn| repository::get_global_kpis(conn)?.ok_or_else(not_refreshed))
            .await
    }

    pub async fn get_client_segments(&self) -> Result<Snapshot<Vec<ClientSegment>>> {
        self.db
            .read(|conn| repository::get_client_segments(conn)?.ok_or_else(not_refreshed))
            .await
    }

    /// Ranked categories, at most `limit` of them (`top_categories_limit`
    /// when `None`).
    pub async fn get_top_work_categories(
        &self,
        limit: Option<usize>,
    ) -> Result<Snapshot<Vec<WorkCategoryStat>>> {
        self.db
            .read(move |conn| {
                let limit = match limit {
                    Some(l) => l,
                    None => EngineConfig::load(conn)?.top_categories_limit,
                };
                repository::get_top_categories(conn, Some(limit))?.ok_or_else(not_refreshed)
            })
            .await
    }

    /// Work-type rollups for the period of `period_type` containing
    /// `period_date`. Empty until that period has been refreshed.
    pub async fn get_work_type_trend(
        &self,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Vec<WorkTypeStat>> {
        let start = Period::containing(period_type, period_date).period_date();
        self.db
            .read(move |conn| Ok(repository::get_work_type_stats(conn, period_type, start)?))
            .await
    }

    pub async fn get_region_trend(
        &self,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Vec<RegionStat>> {
        let start = Period::containing(period_type, period_date).period_date();
        self.db
            .read(move |conn| Ok(repository::get_region_stats(conn, period_type, start)?))
            .await
    }

    // ── Refresh ──────────────────────────────────────────────────

    pub async fn refresh_all(&self) -> Result<RefreshReport> {
        self.coordinator.refresh_all().await
    }

    pub async fn refresh_trends(&self, period: Period) -> Result<TrendRefreshReport> {
        self.coordinator.refresh_trends(period).await
    }

    pub async fn watermark(&self) -> Result<Option<Watermark>> {
        self.coordinator.watermark().await
    }

    /// Start periodic refreshes at `refresh_interval_secs`.
    pub async fn spawn_scheduler(&self) -> Result<RefreshScheduler> {
        let cfg = self.db.read(|conn| EngineConfig::load(conn)).await?;
        log::info!(
            "Refreshing every {}s (timeout {}s)",
            cfg.refresh_interval_secs,
            cfg.refresh_timeout_secs
        );
        Ok(RefreshScheduler::spawn(
            self.coordinator.clone(),
            cfg.refresh_interval(),
        ))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let local = self.coordinator.is_running();
        self.db
            .read(move |conn| {
                let lease = repository::get_refresh_lease(conn)?;
                let leased = lease.as_ref().is_some_and(|l| l.is_live(chrono::Utc::now()));
                Ok(EngineStatus {
                    counts: repository::store_counts(conn)?,
                    watermark: repository::get_refresh_state(conn)?,
                    refresh_running: local || leased,
                    lease,
                    config: EngineConfig::load(conn)?,
                })
            })
            .await
    }

    // ── Record store ─────────────────────────────────────────────

    pub async fn create_client(&self, client: NewClient) -> Result<i64> {
        self.db
            .write(move |w| repository::insert_client(w, &client))
            .await
    }

    pub async fn get_client(&self, id: i64) -> Result<Client> {
        self.db
            .read(move |conn| {
                repository::get_client(conn, id)?
                    .ok_or_else(|| Error::NotFound(format!("client {id}")))
            })
            .await
    }

    pub async fn update_client(&self, id: i64, patch: ClientPatch) -> Result<()> {
        self.db
            .write(move |w| repository::update_client_contact(w, id, &patch))
            .await
    }

    pub async fn soft_delete_client(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::soft_delete_client(w, id))
            .await
    }

    pub async fn restore_client(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::restore_client(w, id))
            .await
    }

    /// Hard delete. The client's quotes and payments are kept with their
    /// client reference cleared.
    pub async fn delete_client(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::delete_client(w, id))
            .await
    }

    pub async fn create_quote(&self, quote: NewQuote) -> Result<i64> {
        self.db
            .write(move |w| repository::insert_quote(w, &quote))
            .await
    }

    pub async fn get_quote(&self, id: i64) -> Result<Quote> {
        self.db
            .read(move |conn| {
                repository::get_quote(conn, id)?
                    .ok_or_else(|| Error::NotFound(format!("quote {id}")))
            })
            .await
    }

    pub async fn update_quote(&self, id: i64, patch: QuotePatch) -> Result<Quote> {
        self.db
            .write(move |w| repository::update_quote(w, id, &patch))
            .await
    }

    pub async fn soft_delete_quote(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::soft_delete_quote(w, id))
            .await
    }

    pub async fn restore_quote(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::restore_quote(w, id))
            .await
    }

    pub async fn delete_quote(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::delete_quote(w, id))
            .await
    }

    pub async fn add_work_area(&self, area: NewWorkArea) -> Result<i64> {
        self.db
            .write(move |w| repository::insert_work_area(w, &area))
            .await
    }

    pub async fn work_areas(&self, quote_id: i64) -> Result<Vec<WorkArea>> {
        self.db
            .read(move |conn| Ok(repository::list_work_areas(conn, quote_id)?))
            .await
    }

    /// Remove a work area. Its line items stay on the quote, detached.
    pub async fn delete_work_area(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::delete_work_area(w, id))
            .await
    }

    pub async fn add_line_item(&self, item: NewLineItem) -> Result<i64> {
        self.db
            .write(move |w| repository::insert_line_item(w, &item))
            .await
    }

    pub async fn line_items(&self, quote_id: i64) -> Result<Vec<LineItem>> {
        self.db
            .read(move |conn| Ok(repository::list_line_items(conn, quote_id)?))
            .await
    }

    pub async fn delete_line_item(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::delete_line_item(w, id))
            .await
    }

    pub async fn add_payment(&self, payment: NewPayment) -> Result<i64> {
        self.db
            .write(move |w| repository::insert_payment(w, &payment))
            .await
    }

    pub async fn payments(&self, quote_id: i64) -> Result<Vec<Payment>> {
        self.db
            .read(move |conn| Ok(repository::list_payments(conn, quote_id)?))
            .await
    }

    pub async fn set_payment_status(&self, id: i64, status: PaymentStatus) -> Result<()> {
        self.db
            .write(move |w| repository::update_payment_status(w, id, status))
            .await
    }

    pub async fn delete_payment(&self, id: i64) -> Result<bool> {
        self.db
            .write(move |w| repository::delete_payment(w, id))
            .await
    }

    /// Apply a batch in one transaction; nothing is kept if any record fails.
    pub async fn import_batch(&self, batch: ImportBatch) -> Result<ImportReport> {
        self.db
            .write(move |w| load::import_batch(w, &batch))
            .await
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .read(move |conn| Ok(repository::get_config(conn, &key)?))
            .await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config::validate(key, value)?;
        let key = key.to_string();
        let value = value.trim().to_string();
        self.db
            .write(move |w| Ok(repository::set_config(w, &key, &value)?))
            .await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .read(|conn| Ok(repository::list_config(conn)?))
            .await
    }
}

fn not_refreshed() -> Error {
    Error::NotFound("no dashboard snapshot yet; run a refresh first".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::date;

    async fn engine() -> EstimateDW {
        EstimateDW::new(Database::open_memory().await.unwrap())
    }

    fn quote(number: &str, client: Option<i64>, status: QuoteStatus, ht: f64) -> NewQuote {
        let mut q = NewQuote::new(number, client, date(2025, 3, 10));
        q.status = status;
        q.total_ht = ht;
        q.vat_10 = ht / 10.0;
        q
    }

    #[tokio::test]
    async fn test_conversion_rate_two_of_three_accepted() {
        let dw = engine().await;
        let c = dw
            .create_client(NewClient::new("Morel", ClientType::Individual))
            .await
            .unwrap();
        dw.create_quote(quote("D-1", Some(c), QuoteStatus::Accepted, 100.0)).await.unwrap();
        dw.create_quote(quote("D-2", Some(c), QuoteStatus::Accepted, 100.0)).await.unwrap();
        dw.create_quote(quote("D-3", Some(c), QuoteStatus::Rejected, 100.0)).await.unwrap();

        let report = dw.get_client_metrics(c).await.unwrap();
        assert_eq!(report.metrics.quote_count, 3);
        assert_eq!(report.metrics.conversion_rate, 66.67);
    }

    #[tokio::test]
    async fn test_accepting_quote_updates_owner() {
        let dw = engine().await;
        let c = dw
            .create_client(NewClient::new("Morel", ClientType::Individual))
            .await
            .unwrap();
        let before = dw.get_client_metrics(c).await.unwrap().metrics;
        assert_eq!(before, ClientMetrics::default());

        let mut q = NewQuote::new("D-1", Some(c), date(2025, 3, 10));
        q.total_ht = 1000.0;
        q.vat_10 = 100.0;
        let id = dw.create_quote(q).await.unwrap();
        assert_eq!(dw.get_quote(id).await.unwrap().total_ttc, 1100.0);

        dw.update_quote(
            id,
            QuotePatch {
                status: Some(QuoteStatus::Accepted),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let after = dw.get_client_metrics(c).await.unwrap().metrics;
        assert_eq!(after.revenue_ht - before.revenue_ht, 1000.0);
        assert_eq!(after.revenue_ttc - before.revenue_ttc, 1100.0);
        assert_eq!(after.conversion_rate, 100.0);
    }

    #[tokio::test]
    async fn test_snapshot_reads_before_first_refresh() {
        let dw = engine().await;
        assert!(matches!(dw.get_global_kpis().await, Err(Error::NotFound(_))));
        assert!(matches!(dw.get_client_segments().await, Err(Error::NotFound(_))));
        assert!(matches!(
            dw.get_top_work_categories(None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_store_refresh() {
        let dw = engine().await;
        let report = dw.refresh_all().await.unwrap();
        assert_eq!(report.version, 1);

        let kpis = dw.get_global_kpis().await.unwrap();
        assert_eq!(kpis.data.total_quotes, 0);
        assert_eq!(kpis.data.thermal_leak_pct, 0.0);
        assert!(dw.get_client_segments().await.unwrap().data.is_empty());
        assert!(dw.get_top_work_categories(None).await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_client_quote_stays_in_kpis_only() {
        let dw = engine().await;
        let pro = dw
            .create_client(NewClient::new("Bati", ClientType::ProConstruction))
            .await
            .unwrap();
        let ind = dw
            .create_client(NewClient::new("Morel", ClientType::Individual))
            .await
            .unwrap();
        let q = dw
            .create_quote(quote("D-1", Some(pro), QuoteStatus::Accepted, 500.0))
            .await
            .unwrap();
        dw.create_quote(quote("D-2", Some(ind), QuoteStatus::Pending, 200.0))
            .await
            .unwrap();

        assert!(dw.delete_client(pro).await.unwrap());
        assert_eq!(dw.get_quote(q).await.unwrap().client_id, None);

        dw.refresh_all().await.unwrap();
        let kpis = dw.get_global_kpis().await.unwrap().data;
        assert_eq!(kpis.total_quotes, 2);
        assert_eq!(kpis.total_ht, 700.0);

        let segments = dw.get_client_segments().await.unwrap().data;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].client_type, ClientType::Individual);
        assert_eq!(segments[0].revenue_ht, 200.0);
        let total_pct: f64 = segments.iter().map(|s| s.client_pct).sum();
        assert!((total_pct - 100.0).abs() < 0.2);
        assert_eq!(dw.status().await.unwrap().counts.unassigned_quotes, 1);
    }

    #[tokio::test]
    async fn test_child_record_deletes() {
        let dw = engine().await;
        let c = dw
            .create_client(NewClient::new("Morel", ClientType::Individual))
            .await
            .unwrap();
        let q = dw
            .create_quote(quote("D-1", Some(c), QuoteStatus::Accepted, 300.0))
            .await
            .unwrap();
        let area = dw
            .add_work_area(NewWorkArea {
                quote_id: q,
                name: "Cuisine".into(),
                surface_m2: Some(9.0),
            })
            .await
            .unwrap();
        let mut tiles = NewLineItem::new(q, "Carrelage", 2.0, 50.0);
        tiles.work_area_id = Some(area);
        dw.add_line_item(tiles).await.unwrap();
        let paint = dw
            .add_line_item(NewLineItem::new(q, "Peinture", 4.0, 50.0))
            .await
            .unwrap();
        let payment = dw
            .add_payment(NewPayment {
                quote_id: q,
                client_id: Some(c),
                amount: 330.0,
                method: PaymentMethod::Transfer,
                status: PaymentStatus::Validated,
                paid_at: None,
                transaction_ref: None,
                external_order_id: None,
            })
            .await
            .unwrap();
        dw.refresh_all().await.unwrap();
        assert_eq!(dw.get_top_work_categories(None).await.unwrap().data.len(), 2);
        let metrics_before = dw.get_client_metrics(c).await.unwrap().metrics;

        assert!(dw.delete_line_item(paint).await.unwrap());
        assert!(!dw.delete_line_item(paint).await.unwrap());
        // Published categories only move on the next refresh.
        assert_eq!(dw.get_top_work_categories(None).await.unwrap().data.len(), 2);
        dw.refresh_all().await.unwrap();
        let top = dw.get_top_work_categories(None).await.unwrap().data;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].category, "Carrelage");

        assert!(dw.delete_work_area(area).await.unwrap());
        assert!(dw.work_areas(q).await.unwrap().is_empty());
        let lines = dw.line_items(q).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].work_area_id, None);

        assert!(dw.delete_payment(payment).await.unwrap());
        assert!(!dw.delete_payment(payment).await.unwrap());
        assert!(dw.payments(q).await.unwrap().is_empty());
        // Payments do not feed client metrics.
        assert_eq!(dw.get_client_metrics(c).await.unwrap().metrics, metrics_before);
    }

    #[tokio::test]
    async fn test_top_categories_default_limit_from_config() {
        let dw = engine().await;
        let q = dw
            .create_quote(quote("D-1", None, QuoteStatus::Pending, 100.0))
            .await
            .unwrap();
        for cat in ["Plomberie", "Peinture", "Electricite"] {
            dw.add_line_item(NewLineItem::new(q, cat, 1.0, 10.0)).await.unwrap();
        }
        dw.config_set(config::TOP_CATEGORIES_LIMIT, "2").await.unwrap();
        dw.refresh_all().await.unwrap();

        assert_eq!(dw.get_top_work_categories(None).await.unwrap().data.len(), 2);
        let all = dw.get_top_work_categories(Some(10)).await.unwrap().data;
        let names: Vec<_> = all.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, vec!["Electricite", "Peinture", "Plomberie"]);
    }

    #[tokio::test]
    async fn test_trend_lookup_accepts_any_date_in_period() {
        let dw = engine().await;
        let q = dw
            .create_quote(quote("D-1", None, QuoteStatus::Accepted, 100.0))
            .await
            .unwrap();
        dw.add_line_item(NewLineItem::new(q, "Peinture", 2.0, 50.0)).await.unwrap();
        dw.refresh_trends(Period::parse("2025-03").unwrap()).await.unwrap();

        let rows = dw
            .get_work_type_trend(PeriodType::Month, date(2025, 3, 17))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].period_date, date(2025, 3, 1));
        assert_eq!(rows[0].trend, TrendDirection::Up);

        let regions = dw
            .get_region_trend(PeriodType::Month, date(2025, 3, 1))
            .await
            .unwrap();
        assert_eq!(regions.len(), 1);
        assert!(dw
            .get_region_trend(PeriodType::Month, date(2025, 4, 1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_config_set_validates() {
        let dw = engine().await;
        assert!(matches!(
            dw.config_set(config::REFRESH_TIMEOUT_SECS, "0").await,
            Err(Error::Config(_))
        ));
        dw.config_set(config::REFRESH_TIMEOUT_SECS, "12").await.unwrap();
        assert_eq!(
            dw.config_get(config::REFRESH_TIMEOUT_SECS).await.unwrap().as_deref(),
            Some("12")
        );
        let status = dw.status().await.unwrap();
        assert_eq!(status.config.refresh_timeout_secs, 12);
        assert!(status.watermark.is_none());
        assert!(!status.refresh_running);
        assert!(status.lease.is_none());
    }

    #[tokio::test]
    async fn test_status_reports_lease_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let dw = EstimateDW::open(Some(path.as_path())).await.unwrap();
        let other = Database::open_at(&path).await.unwrap();
        other
            .write(|w| {
                repository::claim_refresh_lease(w, "elsewhere", w.now() + chrono::Duration::seconds(60))
            })
            .await
            .unwrap();

        let status = dw.status().await.unwrap();
        assert!(status.refresh_running);
        assert_eq!(status.lease.unwrap().holder, "elsewhere");
        assert!(matches!(dw.refresh_all().await, Err(Error::RefreshInProgress)));

        other
            .write(|w| repository::release_refresh_lease(w, "elsewhere"))
            .await
            .unwrap();
        assert!(!dw.status().await.unwrap().refresh_running);
        assert_eq!(dw.refresh_all().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_import_then_refresh() {
        let dw = engine().await;
        let batch = ImportBatch::from_json(
            r#"{
                "clients": [{"name": "Garnier", "client_type": "PRO_REAL_ESTATE"}],
                "quotes": [{"number": "D-9", "client_name": "Garnier",
                            "quote_date": "2025-02-01", "status": "ACCEPTED",
                            "total_ht": 400.0, "vat_10": 40.0}]
            }"#,
        )
        .unwrap();
        let report = dw.import_batch(batch).await.unwrap();
        assert_eq!(report.quotes_inserted, 1);

        dw.refresh_all().await.unwrap();
        let kpis = dw.get_global_kpis().await.unwrap().data;
        assert_eq!(kpis.total_quotes, 1);
        assert_eq!(kpis.total_ttc, 440.0);
        assert_eq!(kpis.distinct_clients, 1);
    }
}
