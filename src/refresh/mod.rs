//! Refresh Coordinator.
//!
//! A refresh has two phases. The read phase loads one consistent snapshot of
//! the record store and runs the pure builders; it is bounded by a timeout and
//! may be cancelled, and abandoning it leaves nothing behind. The write phase
//! swaps the results in with a single transaction.
//!
//! At most one refresh (dashboard or trends) runs at a time per database
//! file. Within a process a mutex rejects the second request; across
//! processes (or separate [`Database`] handles on one file) a lease row in
//! the database does. Either way the loser gets
//! [`Error::RefreshInProgress`] instead of queueing.
//!
//! The lease expires `refresh_timeout + LEASE_MARGIN` after it is taken, so a
//! crashed holder does not block refreshes forever. A holder whose lease was
//! taken over, or whose read predates a newer published version, discards
//! its results with [`Error::RefreshSuperseded`].

pub mod scheduler;

pub use scheduler::RefreshScheduler;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::aggregate::{self, DashboardSnapshots};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::query::period::Period;
use crate::storage::{repository, Database};

/// Lease lifetime beyond the read-phase timeout, covering the publish write.
pub const LEASE_MARGIN: Duration = Duration::from_secs(30);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);

/// Identifies the last successful dashboard refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watermark {
    /// Increases by one per refresh.
    pub version: i64,
    /// Strictly increasing across refreshes.
    pub refreshed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Watermark {
    /// The watermark following `previous`. `refreshed_at` moves forward by at
    /// least a millisecond even if the clock did not.
    pub fn next(previous: Option<&Watermark>, now: DateTime<Utc>, duration_ms: u64) -> Self {
        match previous {
            None => Self {
                version: 1,
                refreshed_at: now,
                duration_ms,
            },
            Some(prev) => Self {
                version: prev.version + 1,
                refreshed_at: now.max(prev.refreshed_at + chrono::Duration::milliseconds(1)),
                duration_ms,
            },
        }
    }
}

/// The database-held refresh exclusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshLease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshStatus {
    /// New snapshot contents.
    Refreshed,
    /// Rebuilt with the same contents; only the watermark moved.
    Unchanged,
}

/// Outcome of a successful dashboard refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub version: i64,
    pub refreshed_at: DateTime<Utc>,
    pub status: RefreshStatus,
    pub duration_ms: u64,
    pub total_quotes: u64,
    pub segments: usize,
    pub categories: usize,
}

/// Outcome of a trend refresh for one period.
#[derive(Debug, Clone, Serialize)]
pub struct TrendRefreshReport {
    pub period: String,
    pub work_type_rows: usize,
    pub region_rows: usize,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Clones share the in-process exclusion and the lease holder id.
#[derive(Clone)]
pub struct RefreshCoordinator {
    db: Database,
    gate: Arc<Mutex<()>>,
    holder: Arc<str>,
    timeout: Option<Duration>,
}

impl RefreshCoordinator {
    pub fn new(db: Database) -> Self {
        let holder = format!(
            "pid{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            db,
            gate: Arc::new(Mutex::new(())),
            holder: holder.into(),
            timeout: None,
        }
    }

    /// Use a fixed read-phase timeout instead of `refresh_timeout_secs`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True while a refresh started through this coordinator (or a clone)
    /// holds the exclusion. See [`lease`](Self::lease) for other processes.
    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// The lease id this coordinator writes into `refresh_lease`.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// The current database lease, if any refresh holds one or a crashed
    /// holder left an expired one behind.
    pub async fn lease(&self) -> Result<Option<RefreshLease>> {
        self.db
            .read(|conn| Ok(repository::get_refresh_lease(conn)?))
            .await
    }

    pub async fn watermark(&self) -> Result<Option<Watermark>> {
        self.db
            .read(|conn| Ok(repository::get_refresh_state(conn)?))
            .await
    }

    /// Rebuild Global KPIs, Client Segments and Top Work Categories, in that
    /// order, from one read snapshot and publish them together.
    pub async fn refresh_all(&self) -> Result<RefreshReport> {
        self.refresh_all_until(std::future::pending()).await
    }

    /// Like [`refresh_all`](Self::refresh_all), abandoning the read phase
    /// with [`Error::RefreshCancelled`] if `cancel` completes first.
    pub async fn refresh_all_until<C>(&self, cancel: C) -> Result<RefreshReport>
    where
        C: Future<Output = ()>,
    {
        let _guard = self.acquire()?;
        let started = Instant::now();
        let timeout = self.read_timeout().await?;
        self.leased(timeout, self.publish_dashboard(timeout, cancel, started))
            .await
    }

    async fn publish_dashboard<C>(
        &self,
        timeout: Duration,
        cancel: C,
        started: Instant,
    ) -> Result<RefreshReport>
    where
        C: Future<Output = ()>,
    {
        let (dashboard, unchanged, seen) = self
            .read_phase(timeout, cancel, |conn| {
                let seen = repository::get_refresh_state(conn)?.map(|w| w.version);
                let snapshot = aggregate::load_store_snapshot(conn)?;
                let dashboard = aggregate::build_dashboard(&snapshot);
                let unchanged = matches_stored(conn, &dashboard)?;
                Ok((dashboard, unchanged, seen))
            })
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        let report_base = (
            dashboard.global.total_quotes,
            dashboard.segments.len(),
            dashboard.top_categories.len(),
        );
        let holder = self.holder.clone();
        let watermark = self
            .db
            .write(move |w| {
                let previous = repository::get_refresh_state(w)?;
                if !repository::holds_refresh_lease(w, &holder)? {
                    log::warn!("Refresh lease was taken over; discarding results");
                    return Err(Error::RefreshSuperseded);
                }
                if previous.as_ref().map(|p| p.version) != seen {
                    log::warn!(
                        "Snapshot moved from v{} to v{} during the read; discarding results",
                        seen.unwrap_or(0),
                        previous.as_ref().map_or(0, |p| p.version)
                    );
                    return Err(Error::RefreshSuperseded);
                }
                let watermark = Watermark::next(previous.as_ref(), w.now(), duration_ms);
                repository::replace_dashboard_snapshots(w, &dashboard, &watermark)?;
                Ok(watermark)
            })
            .await?;

        let status = if unchanged {
            RefreshStatus::Unchanged
        } else {
            RefreshStatus::Refreshed
        };
        log::info!(
            "Refresh v{} complete in {}ms ({:?})",
            watermark.version,
            started.elapsed().as_millis(),
            status
        );
        Ok(RefreshReport {
            version: watermark.version,
            refreshed_at: watermark.refreshed_at,
            status,
            duration_ms: watermark.duration_ms,
            total_quotes: report_base.0,
            segments: report_base.1,
            categories: report_base.2,
        })
    }

    /// Recompute both trend tables for `period` against the period before it.
    pub async fn refresh_trends(&self, period: Period) -> Result<TrendRefreshReport> {
        let _guard = self.acquire()?;
        let started = Instant::now();
        let timeout = self.read_timeout().await?;
        self.leased(timeout, self.publish_trends(timeout, period, started))
            .await
    }

    async fn publish_trends(
        &self,
        timeout: Duration,
        period: Period,
        started: Instant,
    ) -> Result<TrendRefreshReport> {
        let (work_types, regions) = self
            .read_phase(timeout, std::future::pending(), move |conn| {
                let config = EngineConfig::load(conn)?;
                let snapshot = aggregate::load_store_snapshot(conn)?;
                let now = Utc::now();
                let band = config.trend_stable_band_pct;
                Ok((
                    aggregate::build_work_type_stats(&snapshot, &period, now, band),
                    aggregate::build_region_stats(&snapshot, &period, now, band),
                ))
            })
            .await?;

        let counts = (work_types.len(), regions.len());
        let holder = self.holder.clone();
        let updated_at = self
            .db
            .write(move |w| {
                if !repository::holds_refresh_lease(w, &holder)? {
                    log::warn!("Refresh lease was taken over; discarding trend results");
                    return Err(Error::RefreshSuperseded);
                }
                let (period_type, period_date) = (period.period_type(), period.period_date());
                // Rows carry the write's timestamp, not the read's.
                let work_types: Vec<_> = work_types
                    .into_iter()
                    .map(|mut s| {
                        s.updated_at = w.now();
                        s
                    })
                    .collect();
                let regions: Vec<_> = regions
                    .into_iter()
                    .map(|mut s| {
                        s.updated_at = w.now();
                        s
                    })
                    .collect();
                repository::upsert_work_type_stats(w, period_type, period_date, &work_types)?;
                repository::upsert_region_stats(w, period_type, period_date, &regions)?;
                Ok(w.now())
            })
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Trend refresh for {period} complete in {duration_ms}ms ({} work types, {} regions)",
            counts.0,
            counts.1
        );
        Ok(TrendRefreshReport {
            period: period.to_key(),
            work_type_rows: counts.0,
            region_rows: counts.1,
            updated_at,
            duration_ms,
        })
    }

    fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.gate.try_lock().map_err(|_| {
            log::warn!("Refresh rejected: another refresh is in progress");
            Error::RefreshInProgress
        })
    }

    async fn read_timeout(&self) -> Result<Duration> {
        match self.timeout {
            Some(t) => Ok(t),
            None => Ok(self
                .db
                .read(|conn| EngineConfig::load(conn))
                .await?
                .refresh_timeout()),
        }
    }

    /// Run `work` while holding the database lease. The lease is released
    /// afterwards whatever the outcome; if this future is dropped instead,
    /// the lease lapses at its expiry.
    async fn leased<T>(&self, timeout: Duration, work: impl Future<Output = Result<T>>) -> Result<T> {
        let ttl = chrono::Duration::from_std(timeout + LEASE_MARGIN)
            .map_err(|e| Error::Config(format!("refresh timeout out of range: {e}")))?;
        let holder = self.holder.clone();
        self.db
            .write(move |w| repository::claim_refresh_lease(w, &holder, w.now() + ttl))
            .await?;

        let out = work.await;

        let holder = self.holder.clone();
        match self
            .db
            .write(move |w| repository::release_refresh_lease(w, &holder))
            .await
        {
            Ok(true) => {}
            Ok(false) => log::debug!("Refresh lease already taken over by another holder"),
            Err(e) => log::warn!("Failed to release refresh lease: {e}"),
        }
        out
    }

    async fn read_phase<T, F, C>(&self, timeout: Duration, cancel: C, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
        C: Future<Output = ()>,
    {
        tokio::select! {
            res = tokio::time::timeout(timeout, self.db.read(f)) => match res {
                Ok(out) => out,
                Err(_) => {
                    log::warn!(
                        "Refresh abandoned after {}ms; previous snapshot stays current",
                        timeout.as_millis()
                    );
                    Err(Error::RefreshTimeout(timeout.as_secs()))
                }
            },
            _ = cancel => {
                log::warn!("Refresh cancelled during read phase");
                Err(Error::RefreshCancelled)
            }
        }
    }
}

/// True when the stored snapshots already hold exactly `dashboard`.
fn matches_stored(conn: &rusqlite::Connection, dashboard: &DashboardSnapshots) -> Result<bool> {
    let Some(global) = repository::get_global_kpis(conn)? else {
        return Ok(false);
    };
    let segments = repository::get_client_segments(conn)?.map(|s| s.data);
    let top = repository::get_top_categories(conn, None)?.map(|s| s.data);
    Ok(global.data == dashboard.global
        && segments.as_ref() == Some(&dashboard.segments)
        && top.as_ref() == Some(&dashboard.top_categories))
}
