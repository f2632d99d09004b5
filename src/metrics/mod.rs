pub mod types;

pub use types::*;

use crate::error::{Error, Result};
use crate::guard::{self, SoftDeletable, Write};
use crate::model::QuoteStatus;
use crate::storage::repository;
use crate::storage::Database;

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// `part / whole * 100`, rounded. A zero denominator yields 0 rather than
/// NaN; every percentage in the crate goes through here.
pub fn rate_pct(part: f64, whole: f64, decimals: u32) -> f64 {
    if whole == 0.0 {
        return 0.0;
    }
    round_to(part / whole * 100.0, decimals)
}

/// Derive a client's metrics from all of its quotes (deleted ones included;
/// they are filtered here).
pub fn compute_client_metrics(quotes: &[QuoteFacts]) -> ClientMetrics {
    let mut total = 0u64;
    let mut accepted = 0u64;
    let mut revenue_ht = 0.0;
    let mut revenue_ttc = 0.0;

    for q in guard::active(quotes) {
        total += 1;
        if q.status == QuoteStatus::Accepted {
            accepted += 1;
        }
        revenue_ht += q.total_ht;
        revenue_ttc += q.total_ttc;
    }

    ClientMetrics {
        quote_count: total,
        revenue_ht: round_to(revenue_ht, 2),
        revenue_ttc: round_to(revenue_ttc, 2),
        conversion_rate: rate_pct(accepted as f64, total as f64, 2),
    }
}

/// Recompute and persist the derived fields of one client.
///
/// Returns `Ok(None)` when the client does not exist: its quotes may still
/// point at it through a foreign key that is about to be nulled.
pub fn recompute_client(w: &Write<'_>, client_id: i64) -> Result<Option<ClientMetrics>> {
    if !repository::client_exists(w, client_id)? {
        log::debug!("Client {client_id} not found, skipping metric recompute");
        return Ok(None);
    }
    let facts = repository::list_quote_facts_for_client(w, client_id)?;
    let metrics = compute_client_metrics(&facts);
    repository::write_client_metrics(w, client_id, &metrics)?;
    Ok(Some(metrics))
}

/// Recompute every client touched by a quote write: the previous owner and
/// the new one (the same client is only recomputed once).
pub fn on_quote_changed(
    w: &Write<'_>,
    previous_client: Option<i64>,
    current_client: Option<i64>,
) -> Result<()> {
    if let Some(id) = previous_client {
        recompute_client(w, id)?;
    }
    if let Some(id) = current_client {
        if Some(id) != previous_client {
            recompute_client(w, id)?;
        }
    }
    Ok(())
}

/// Read the persisted metrics of an active client.
pub async fn get_client_metrics(db: &Database, client_id: i64) -> Result<ClientMetricsReport> {
    db.read(move |conn| {
        let client = repository::get_client(conn, client_id)?
            .filter(|c| c.is_active())
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))?;
        Ok(ClientMetricsReport {
            client_id: client.id,
            client_name: client.name,
            client_type: client.client_type,
            metrics: ClientMetrics {
                quote_count: client.quote_count.max(0) as u64,
                revenue_ht: client.revenue_ht,
                revenue_ttc: client.revenue_ttc,
                conversion_rate: client.conversion_rate,
            },
            updated_at: client.updated_at,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientType, NewClient, NewQuote, QuotePatch};
    use crate::test_support::{date, facts, seed_client, seed_quote};
    use chrono::Utc;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(66.666_666, 2), 66.67);
        assert_eq!(round_to(33.333_333, 1), 33.3);
        assert_eq!(round_to(0.125, 2), 0.13);
        assert_eq!(round_to(-0.125, 2), -0.13);
    }

    #[test]
    fn test_rate_pct_zero_denominator() {
        assert_eq!(rate_pct(0.0, 0.0, 2), 0.0);
        assert_eq!(rate_pct(5.0, 0.0, 1), 0.0);
        assert_eq!(rate_pct(1.0, 4.0, 1), 25.0);
    }

    #[test]
    fn test_no_quotes_means_zero_conversion() {
        let m = compute_client_metrics(&[]);
        assert_eq!(m, ClientMetrics::default());
        assert_eq!(m.conversion_rate, 0.0);
    }

    #[test]
    fn test_only_deleted_quotes_means_zero_conversion() {
        let mut q = facts(QuoteStatus::Accepted, 100.0, 110.0);
        q.deleted_at = Some(Utc::now());
        let m = compute_client_metrics(&[q]);
        assert_eq!(m.quote_count, 0);
        assert_eq!(m.revenue_ht, 0.0);
        assert_eq!(m.conversion_rate, 0.0);
    }

    #[test]
    fn test_two_of_three_accepted() {
        let quotes = vec![
            facts(QuoteStatus::Accepted, 1000.0, 1100.0),
            facts(QuoteStatus::Accepted, 500.0, 600.0),
            facts(QuoteStatus::Rejected, 250.0, 300.0),
        ];
        let m = compute_client_metrics(&quotes);
        assert_eq!(m.quote_count, 3);
        assert_eq!(m.conversion_rate, 66.67);
        assert_eq!(m.revenue_ht, 1750.0);
        assert_eq!(m.revenue_ttc, 2000.0);
    }

    #[test]
    fn test_deleted_quote_ignored_in_every_field() {
        let mut deleted = facts(QuoteStatus::Accepted, 9999.0, 9999.0);
        deleted.deleted_at = Some(Utc::now());
        let quotes = vec![
            facts(QuoteStatus::Accepted, 100.0, 110.0),
            facts(QuoteStatus::Pending, 100.0, 110.0),
            deleted,
        ];
        let m = compute_client_metrics(&quotes);
        assert_eq!(m.quote_count, 2);
        assert_eq!(m.conversion_rate, 50.0);
        assert_eq!(m.revenue_ht, 200.0);
        assert_eq!(m.revenue_ttc, 220.0);
    }

    #[test]
    fn test_conversion_matches_formula_across_mixes() {
        for total in 1..=12u64 {
            for accepted in 0..=total {
                let quotes: Vec<QuoteFacts> = (0..total)
                    .map(|i| {
                        let status = if i < accepted {
                            QuoteStatus::Accepted
                        } else {
                            QuoteStatus::Expired
                        };
                        facts(status, 10.0, 12.0)
                    })
                    .collect();
                let m = compute_client_metrics(&quotes);
                let expected = (accepted as f64 / total as f64 * 100.0 * 100.0).round() / 100.0;
                assert_eq!(m.conversion_rate, expected, "{accepted}/{total}");
            }
        }
    }

    #[tokio::test]
    async fn test_quote_writes_keep_client_metrics_current() {
        let db = Database::open_memory().await.unwrap();

        let (client_id, q1, _q2, q3) = db
            .write(|w| {
                let c = seed_client(w, "Dupont", ClientType::Individual)?;
                let q1 = seed_quote(w, "D-001", Some(c), date(2025, 1, 10), QuoteStatus::Accepted, 1000.0, 100.0)?;
                let q2 = seed_quote(w, "D-002", Some(c), date(2025, 1, 12), QuoteStatus::Accepted, 500.0, 50.0)?;
                let q3 = seed_quote(w, "D-003", Some(c), date(2025, 1, 15), QuoteStatus::Rejected, 200.0, 20.0)?;
                Ok((c, q1, q2, q3))
            })
            .await
            .unwrap();

        let report = get_client_metrics(&db, client_id).await.unwrap();
        assert_eq!(report.metrics.quote_count, 3);
        assert_eq!(report.metrics.conversion_rate, 66.67);
        assert_eq!(report.metrics.revenue_ht, 1700.0);
        assert_eq!(report.metrics.revenue_ttc, 1870.0);

        // Soft-deleting a quote is picked up synchronously.
        db.write(move |w| {
            repository::soft_delete_quote(w, q3)?;
            Ok(())
        })
        .await
        .unwrap();
        let report = get_client_metrics(&db, client_id).await.unwrap();
        assert_eq!(report.metrics.quote_count, 2);
        assert_eq!(report.metrics.conversion_rate, 100.0);
        assert_eq!(report.metrics.revenue_ht, 1500.0);

        // Status change.
        db.write(move |w| {
            let patch = QuotePatch {
                status: Some(QuoteStatus::Rejected),
                ..Default::default()
            };
            repository::update_quote(w, q1, &patch)?;
            Ok(())
        })
        .await
        .unwrap();
        let report = get_client_metrics(&db, client_id).await.unwrap();
        assert_eq!(report.metrics.conversion_rate, 50.0);
    }

    #[tokio::test]
    async fn test_status_change_to_accepted_reflects_quote_totals() {
        let db = Database::open_memory().await.unwrap();

        let (client_id, quote_id) = db
            .write(|w| {
                let c = seed_client(w, "Martin", ClientType::ProConstruction)?;
                let mut q = NewQuote::new("D-100", Some(c), date(2025, 2, 1));
                q.total_ht = 1000.0;
                q.vat_10 = 100.0;
                q.vat_20 = 0.0;
                let id = repository::insert_quote(w, &q)?;
                Ok((c, id))
            })
            .await
            .unwrap();

        let quote = db
            .read(move |conn| Ok(repository::get_quote(conn, quote_id)?))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quote.total_ttc, 1100.0);

        db.write(move |w| {
            let patch = QuotePatch {
                status: Some(QuoteStatus::Accepted),
                ..Default::default()
            };
            repository::update_quote(w, quote_id, &patch)?;
            Ok(())
        })
        .await
        .unwrap();

        let report = get_client_metrics(&db, client_id).await.unwrap();
        assert_eq!(report.metrics.revenue_ht, 1000.0);
        assert_eq!(report.metrics.revenue_ttc, 1100.0);
        assert_eq!(report.metrics.conversion_rate, 100.0);
    }

    #[tokio::test]
    async fn test_reassigning_quote_updates_both_clients() {
        let db = Database::open_memory().await.unwrap();

        let (a, b, q) = db
            .write(|w| {
                let a = seed_client(w, "A", ClientType::Individual)?;
                let b = seed_client(w, "B", ClientType::Individual)?;
                let q = seed_quote(w, "D-1", Some(a), date(2025, 3, 1), QuoteStatus::Accepted, 300.0, 30.0)?;
                Ok((a, b, q))
            })
            .await
            .unwrap();

        db.write(move |w| {
            let patch = QuotePatch {
                client_id: Some(Some(b)),
                ..Default::default()
            };
            repository::update_quote(w, q, &patch)?;
            Ok(())
        })
        .await
        .unwrap();

        let ma = get_client_metrics(&db, a).await.unwrap().metrics;
        let mb = get_client_metrics(&db, b).await.unwrap().metrics;
        assert_eq!(ma, ClientMetrics::default());
        assert_eq!(mb.quote_count, 1);
        assert_eq!(mb.revenue_ht, 300.0);
        assert_eq!(mb.conversion_rate, 100.0);
    }

    #[tokio::test]
    async fn test_recompute_missing_client_is_noop() {
        let db = Database::open_memory().await.unwrap();
        let out = db.write(|w| recompute_client(w, 424242)).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_get_metrics_for_deleted_client_is_not_found() {
        let db = Database::open_memory().await.unwrap();
        let id = db
            .write(|w| {
                let id = repository::insert_client(w, &NewClient::new("Gone", ClientType::Individual))?;
                repository::soft_delete_client(w, id)?;
                Ok(id)
            })
            .await
            .unwrap();
        let err = get_client_metrics(&db, id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
