//! Batch import of records from a JSON document.
//!
//! A batch is applied in one write: clients first, then quotes, work areas,
//! line items and payments, each stage resolving references to the ones
//! before it by natural key (client name, quote number, work area name,
//! client email).

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::guard::Write;
use crate::model::{
    EnergyRating, NewClient, NewLineItem, NewPayment, NewQuote, NewWorkArea, PaymentMethod,
    PaymentStatus, QuoteStatus,
};
use crate::storage::repository;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportBatch {
    pub clients: Vec<NewClient>,
    pub quotes: Vec<ImportQuote>,
    pub work_areas: Vec<ImportWorkArea>,
    pub line_items: Vec<ImportLineItem>,
    pub payments: Vec<ImportPayment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportQuote {
    pub number: String,
    /// Owning client, by exact name.
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub site_address: Option<String>,
    #[serde(default)]
    pub site_postal_code: Option<String>,
    #[serde(default)]
    pub site_city: Option<String>,
    #[serde(default)]
    pub surface_m2: Option<f64>,
    pub quote_date: NaiveDate,
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<QuoteStatus>,
    #[serde(default)]
    pub total_ht: f64,
    #[serde(default)]
    pub vat_10: f64,
    #[serde(default)]
    pub vat_20: f64,
    #[serde(default)]
    pub total_ttc: Option<f64>,
    #[serde(default)]
    pub energy_before: Option<EnergyRating>,
    #[serde(default)]
    pub energy_after: Option<EnergyRating>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportWorkArea {
    pub quote_number: String,
    pub name: String,
    #[serde(default)]
    pub surface_m2: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportLineItem {
    pub quote_number: String,
    /// Work area name within the same quote.
    #[serde(default)]
    pub work_area: Option<String>,
    #[serde(default)]
    pub line_number: Option<i64>,
    pub designation: String,
    pub category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
    pub quantity: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub unit_price_ht: f64,
    #[serde(default = "default_vat_rate")]
    pub vat_rate: f64,
    /// Defaults to quantity × unit price.
    #[serde(default)]
    pub total_ht: Option<f64>,
}

fn default_vat_rate() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportPayment {
    pub quote_number: String,
    #[serde(default)]
    pub client_email: Option<String>,
    pub amount: f64,
    pub method: PaymentMethod,
    #[serde(default = "default_payment_status")]
    pub status: PaymentStatus,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transaction_ref: Option<String>,
    #[serde(default)]
    pub external_order_id: Option<i64>,
}

fn default_payment_status() -> PaymentStatus {
    PaymentStatus::Pending
}

impl ImportBatch {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Other(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub clients_inserted: u64,
    pub clients_updated: u64,
    pub quotes_inserted: u64,
    /// Quote numbers already present; the existing quote is left as is.
    pub quotes_skipped: u64,
    /// Quotes whose client name matched nothing; stored without a client.
    pub quotes_unassigned: u64,
    pub work_areas_inserted: u64,
    pub line_items_inserted: u64,
    pub payments_inserted: u64,
    /// Work areas, line items and payments referencing an unknown or skipped quote.
    pub children_skipped: u64,
}

/// Apply `batch` inside `w`. Any error aborts the enclosing write, so the
/// batch lands entirely or not at all.
pub fn import_batch(w: &Write<'_>, batch: &ImportBatch) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for client in &batch.clients {
        let (_, inserted) = repository::upsert_client_by_name(w, client)?;
        if inserted {
            report.clients_inserted += 1;
        } else {
            report.clients_updated += 1;
        }
    }

    // Children of quotes skipped here are skipped too, so re-importing the
    // same batch adds nothing.
    let mut skipped_numbers: HashSet<&str> = HashSet::new();
    for q in &batch.quotes {
        if repository::quote_id_by_number(w, q.number.trim())?.is_some() {
            log::debug!("Quote {} already exists, skipping", q.number);
            skipped_numbers.insert(q.number.trim());
            report.quotes_skipped += 1;
            continue;
        }
        let client_id = match &q.client_name {
            Some(name) => {
                let id = repository::find_client_by_name(w, name.trim(), false)?.map(|c| c.id);
                if id.is_none() {
                    log::warn!("Quote {}: no active client named {name:?}", q.number);
                    report.quotes_unassigned += 1;
                }
                id
            }
            None => None,
        };
        let mut new = NewQuote::new(&q.number, client_id, q.quote_date);
        new.site_address = q.site_address.clone();
        new.site_postal_code = q.site_postal_code.clone();
        new.site_city = q.site_city.clone();
        new.surface_m2 = q.surface_m2;
        new.valid_until = q.valid_until;
        new.status = q.status.unwrap_or(QuoteStatus::Pending);
        new.total_ht = q.total_ht;
        new.vat_10 = q.vat_10;
        new.vat_20 = q.vat_20;
        new.total_ttc = q.total_ttc;
        new.energy_before = q.energy_before;
        new.energy_after = q.energy_after;
        repository::insert_quote(w, &new)?;
        report.quotes_inserted += 1;
    }

    let resolve = |number: &str| -> Result<Option<i64>> {
        let number = number.trim();
        if skipped_numbers.contains(number) {
            return Ok(None);
        }
        Ok(repository::quote_id_by_number(w, number)?)
    };

    for area in &batch.work_areas {
        let Some(quote_id) = resolve(&area.quote_number)? else {
            report.children_skipped += 1;
            continue;
        };
        repository::insert_work_area(
            w,
            &NewWorkArea {
                quote_id,
                name: area.name.clone(),
                surface_m2: area.surface_m2,
            },
        )?;
        report.work_areas_inserted += 1;
    }

    for item in &batch.line_items {
        let Some(quote_id) = resolve(&item.quote_number)? else {
            report.children_skipped += 1;
            continue;
        };
        let work_area_id = match &item.work_area {
            Some(name) => repository::find_work_area_id(w, quote_id, name.trim())?,
            None => None,
        };
        repository::insert_line_item(
            w,
            &NewLineItem {
                quote_id,
                work_area_id,
                line_number: item.line_number,
                designation: item.designation.clone(),
                category: item.category.clone(),
                sub_category: item.sub_category.clone(),
                quantity: item.quantity,
                unit: item.unit.clone(),
                unit_price_ht: item.unit_price_ht,
                vat_rate: item.vat_rate,
                total_ht: item
                    .total_ht
                    .unwrap_or(item.quantity * item.unit_price_ht),
            },
        )?;
        report.line_items_inserted += 1;
    }

    for p in &batch.payments {
        let Some(quote_id) = resolve(&p.quote_number)? else {
            report.children_skipped += 1;
            continue;
        };
        let client_id = match &p.client_email {
            Some(email) => repository::find_client_id_by_email(w, email.trim())?,
            None => None,
        };
        repository::insert_payment(
            w,
            &NewPayment {
                quote_id,
                client_id,
                amount: p.amount,
                method: p.method,
                status: p.status,
                paid_at: p.paid_at,
                transaction_ref: p.transaction_ref.clone(),
                external_order_id: p.external_order_id,
            },
        )?;
        report.payments_inserted += 1;
    }

    log::info!(
        "Imported {} clients, {} quotes ({} skipped), {} line items, {} payments",
        report.clients_inserted + report.clients_updated,
        report.quotes_inserted,
        report.quotes_skipped,
        report.line_items_inserted,
        report.payments_inserted
    );
    Ok(report)
}
