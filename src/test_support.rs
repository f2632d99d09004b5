//! Fixtures shared by unit tests.

use chrono::{NaiveDate, Utc};

use crate::error::Result;
use crate::guard::Write;
use crate::metrics::QuoteFacts;
use crate::model::{Client, ClientType, LineItem, NewClient, NewLineItem, NewQuote, Quote, QuoteStatus};
use crate::storage::repository;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn facts(status: QuoteStatus, total_ht: f64, total_ttc: f64) -> QuoteFacts {
    QuoteFacts {
        status,
        total_ht,
        total_ttc,
        deleted_at: None,
    }
}

pub fn client(id: i64, client_type: ClientType) -> Client {
    let now = Utc::now();
    Client {
        id,
        name: format!("client-{id}"),
        first_name: None,
        email: None,
        phone: None,
        address: None,
        postal_code: None,
        city: None,
        client_type,
        external_id: None,
        quote_count: 0,
        revenue_ht: 0.0,
        revenue_ttc: 0.0,
        conversion_rate: 0.0,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// A quote with 10% VAT on its pre-tax total.
pub fn quote(
    id: i64,
    client_id: Option<i64>,
    quote_date: NaiveDate,
    status: QuoteStatus,
    total_ht: f64,
) -> Quote {
    let now = Utc::now();
    Quote {
        id,
        number: format!("D-{id:04}"),
        client_id,
        site_address: None,
        site_postal_code: None,
        site_city: None,
        surface_m2: None,
        quote_date,
        valid_until: None,
        status,
        total_ht,
        vat_10: total_ht / 10.0,
        vat_20: 0.0,
        total_ttc: total_ht + total_ht / 10.0,
        energy_before: None,
        energy_after: None,
        is_thermal_leak: false,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

pub fn line(id: i64, quote_id: i64, category: &str, quantity: f64, unit_price_ht: f64) -> LineItem {
    let now = Utc::now();
    LineItem {
        id,
        quote_id,
        work_area_id: None,
        line_number: None,
        designation: category.to_string(),
        category: category.to_string(),
        sub_category: None,
        quantity,
        unit: None,
        unit_price_ht,
        vat_rate: 10.0,
        total_ht: quantity * unit_price_ht,
        created_at: now,
        updated_at: now,
    }
}

pub fn seed_client(w: &Write<'_>, name: &str, client_type: ClientType) -> Result<i64> {
    repository::insert_client(w, &NewClient::new(name, client_type))
}

pub fn seed_quote(
    w: &Write<'_>,
    number: &str,
    client_id: Option<i64>,
    quote_date: NaiveDate,
    status: QuoteStatus,
    total_ht: f64,
    vat_10: f64,
) -> Result<i64> {
    let mut q = NewQuote::new(number, client_id, quote_date);
    q.status = status;
    q.total_ht = total_ht;
    q.vat_10 = vat_10;
    repository::insert_quote(w, &q)
}

pub fn seed_line(
    w: &Write<'_>,
    quote_id: i64,
    category: &str,
    quantity: f64,
    unit_price_ht: f64,
) -> Result<i64> {
    repository::insert_line_item(w, &NewLineItem::new(quote_id, category, quantity, unit_price_ht))
}
