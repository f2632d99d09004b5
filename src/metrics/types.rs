use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::guard::SoftDeletable;
use crate::model::{ClientType, QuoteStatus};

/// The four derived fields carried on a client record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    /// Non-deleted quotes owned by the client.
    pub quote_count: u64,
    /// Sum of pre-tax totals over those quotes.
    pub revenue_ht: f64,
    /// Sum of post-tax totals over those quotes.
    pub revenue_ttc: f64,
    /// Accepted / total, as a percentage with two decimals.
    pub conversion_rate: f64,
}

/// The slice of a quote the metric calculator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteFacts {
    pub status: QuoteStatus,
    pub total_ht: f64,
    pub total_ttc: f64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDeletable for QuoteFacts {
    fn deleted_at(&self) -> Option<&DateTime<Utc>> {
        self.deleted_at.as_ref()
    }
}

/// Persisted metrics for one client, as served to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetricsReport {
    pub client_id: i64,
    pub client_name: String,
    pub client_type: ClientType,
    pub metrics: ClientMetrics,
    /// Last time the client row (and so its metrics) was written.
    pub updated_at: DateTime<Utc>,
}
