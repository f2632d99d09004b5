use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::aggregate::{
    ClientSegment, DashboardSnapshots, GlobalKpis, RegionStat, Snapshot, WorkCategoryStat,
    WorkTypeStat,
};
use crate::error::{Error, Result};
use crate::guard::{SoftDeletable, Write, ACTIVE_CLIENT_SQL, ACTIVE_QUOTE_SQL};
use crate::metrics::{self, ClientMetrics, QuoteFacts};
use crate::model::{
    is_thermal_leak, Client, ClientPatch, LineItem, NewClient, NewLineItem, NewPayment, NewQuote,
    NewWorkArea, Payment, PaymentStatus, PeriodType, Quote, QuotePatch, WorkArea,
};
use crate::refresh::{RefreshLease, Watermark};

// ── Clients ────────────────────────────────────────────────────────

pub(crate) const CLIENT_COLUMNS: &str = "id, name, first_name, email, phone, address, postal_code, \
     city, client_type, external_id, quote_count, revenue_ht, revenue_ttc, conversion_rate, \
     created_at, updated_at, deleted_at";

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        first_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        postal_code: row.get(6)?,
        city: row.get(7)?,
        client_type: row.get(8)?,
        external_id: row.get(9)?,
        quote_count: row.get(10)?,
        revenue_ht: row.get(11)?,
        revenue_ttc: row.get(12)?,
        conversion_rate: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        deleted_at: row.get(16)?,
    })
}

pub fn insert_client(w: &Write<'_>, client: &NewClient) -> Result<i64> {
    require(!client.name.trim().is_empty(), "client name must not be empty")?;
    w.execute(
        "INSERT INTO clients (
            name, first_name, email, phone, address, postal_code, city, client_type,
            external_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            client.name.trim(),
            client.first_name,
            client.email,
            client.phone,
            client.address,
            client.postal_code,
            client.city,
            client.client_type,
            client.external_id,
            w.now(),
        ],
    )?;
    Ok(w.last_insert_rowid())
}

/// Insert a client, or refresh the address of the client with the same
/// name. Returns the id and whether a new row was created.
///
/// Names are unique across deleted rows too, so a soft-deleted namesake is
/// updated in place and stays deleted.
pub fn upsert_client_by_name(w: &Write<'_>, client: &NewClient) -> Result<(i64, bool)> {
    if let Some(existing) = find_client_by_name(w, client.name.trim(), true)? {
        if !existing.is_active() {
            log::debug!("Client {:?} is deleted; updating without restoring", existing.name);
        }
        w.execute(
            "UPDATE clients SET
               address = COALESCE(?2, address),
               postal_code = COALESCE(?3, postal_code),
               city = COALESCE(?4, city),
               updated_at = ?5
             WHERE id = ?1",
            params![existing.id, client.address, client.postal_code, client.city, w.now()],
        )?;
        return Ok((existing.id, false));
    }
    Ok((insert_client(w, client)?, true))
}

pub fn get_client(conn: &Connection, id: i64) -> Result<Option<Client>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
        params![id],
        client_from_row,
    )
    .optional()
}

/// True if the row exists, soft-deleted or not.
pub fn client_exists(conn: &Connection, id: i64) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
}

pub fn find_client_by_name(
    conn: &Connection,
    name: &str,
    include_deleted: bool,
) -> Result<Option<Client>, rusqlite::Error> {
    let filter = if include_deleted {
        String::new()
    } else {
        format!("AND {ACTIVE_CLIENT_SQL}")
    };
    conn.query_row(
        &format!("SELECT {CLIENT_COLUMNS} FROM clients c WHERE c.name = ?1 {filter}"),
        params![name],
        client_from_row,
    )
    .optional()
}

/// Resolve an active client by email. The oldest match wins when the same
/// address appears on several clients.
pub fn find_client_id_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT c.id FROM clients c WHERE c.email = ?1 AND {ACTIVE_CLIENT_SQL}
             ORDER BY c.id LIMIT 1"
        ),
        params![email],
        |row| row.get(0),
    )
    .optional()
}

pub fn update_client_contact(w: &Write<'_>, id: i64, patch: &ClientPatch) -> Result<()> {
    if let Some(name) = &patch.name {
        require(!name.trim().is_empty(), "client name must not be empty")?;
    }
    let count = w.execute(
        "UPDATE clients SET
           name = COALESCE(?2, name),
           first_name = COALESCE(?3, first_name),
           email = COALESCE(?4, email),
           phone = COALESCE(?5, phone),
           address = COALESCE(?6, address),
           postal_code = COALESCE(?7, postal_code),
           city = COALESCE(?8, city),
           client_type = COALESCE(?9, client_type),
           updated_at = ?10
         WHERE id = ?1",
        params![
            id,
            patch.name.as_deref().map(str::trim),
            patch.first_name,
            patch.email,
            patch.phone,
            patch.address,
            patch.postal_code,
            patch.city,
            patch.client_type,
            w.now(),
        ],
    )?;
    if count == 0 {
        return Err(Error::NotFound(format!("client {id}")));
    }
    Ok(())
}

/// Mark a client deleted. Returns false if it was already deleted or absent.
pub fn soft_delete_client(w: &Write<'_>, id: i64) -> Result<bool> {
    let count = w.execute(
        &format!(
            "UPDATE clients AS c SET deleted_at = ?2, updated_at = ?2
             WHERE c.id = ?1 AND {ACTIVE_CLIENT_SQL}"
        ),
        params![id, w.now()],
    )?;
    Ok(count > 0)
}

pub fn restore_client(w: &Write<'_>, id: i64) -> Result<bool> {
    let count = w.execute(
        &format!(
            "UPDATE clients AS c SET deleted_at = NULL, updated_at = ?2
             WHERE c.id = ?1 AND NOT ({ACTIVE_CLIENT_SQL})"
        ),
        params![id, w.now()],
    )?;
    Ok(count > 0)
}

/// Remove a client row. Its quotes and payments stay, with their client
/// reference cleared by the foreign key; they are stamped first so the
/// cleared reference carries a fresh `updated_at`.
pub fn delete_client(w: &Write<'_>, id: i64) -> Result<bool> {
    w.execute(
        "UPDATE quotes SET updated_at = ?2 WHERE client_id = ?1",
        params![id, w.now()],
    )?;
    w.execute(
        "UPDATE payments SET updated_at = ?2 WHERE client_id = ?1",
        params![id, w.now()],
    )?;
    let count = w.execute("DELETE FROM clients WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

pub fn list_clients(conn: &Connection, include_deleted: bool) -> Result<Vec<Client>, rusqlite::Error> {
    let filter = if include_deleted {
        String::new()
    } else {
        format!("WHERE {ACTIVE_CLIENT_SQL}")
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients c {filter} ORDER BY c.id"
    ))?;
    let rows = stmt.query_map([], client_from_row)?;
    rows.collect()
}

pub fn write_client_metrics(
    w: &Write<'_>,
    id: i64,
    metrics: &ClientMetrics,
) -> Result<(), rusqlite::Error> {
    w.execute(
        "UPDATE clients SET
           quote_count = ?2, revenue_ht = ?3, revenue_ttc = ?4, conversion_rate = ?5,
           updated_at = ?6
         WHERE id = ?1",
        params![
            id,
            metrics.quote_count as i64,
            metrics.revenue_ht,
            metrics.revenue_ttc,
            metrics.conversion_rate,
            w.now(),
        ],
    )?;
    Ok(())
}

// ── Quotes ─────────────────────────────────────────────────────────

pub(crate) const QUOTE_COLUMNS: &str = "id, number, client_id, site_address, site_postal_code, \
     site_city, surface_m2, quote_date, valid_until, status, total_ht, vat_10, vat_20, total_ttc, \
     energy_before, energy_after, is_thermal_leak, created_at, updated_at, deleted_at";

pub(crate) fn quote_from_row(row: &Row<'_>) -> rusqlite::Result<Quote> {
    Ok(Quote {
        id: row.get(0)?,
        number: row.get(1)?,
        client_id: row.get(2)?,
        site_address: row.get(3)?,
        site_postal_code: row.get(4)?,
        site_city: row.get(5)?,
        surface_m2: row.get(6)?,
        quote_date: row.get(7)?,
        valid_until: row.get(8)?,
        status: row.get(9)?,
        total_ht: row.get(10)?,
        vat_10: row.get(11)?,
        vat_20: row.get(12)?,
        total_ttc: row.get(13)?,
        energy_before: row.get(14)?,
        energy_after: row.get(15)?,
        is_thermal_leak: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
        deleted_at: row.get(19)?,
    })
}

fn validate_amounts(values: &[(&str, f64)]) -> Result<()> {
    for (name, v) in values {
        require(v.is_finite() && *v >= 0.0, &format!("{name} must be a non-negative amount"))?;
    }
    Ok(())
}

/// Insert a quote and bring its client's derived metrics up to date.
pub fn insert_quote(w: &Write<'_>, quote: &NewQuote) -> Result<i64> {
    require(!quote.number.trim().is_empty(), "quote number must not be empty")?;
    let total_ttc = quote.total_ttc();
    validate_amounts(&[
        ("total_ht", quote.total_ht),
        ("vat_10", quote.vat_10),
        ("vat_20", quote.vat_20),
        ("total_ttc", total_ttc),
    ])?;

    w.execute(
        "INSERT INTO quotes (
            number, client_id, site_address, site_postal_code, site_city, surface_m2,
            quote_date, valid_until, status, total_ht, vat_10, vat_20, total_ttc,
            energy_before, energy_after, is_thermal_leak, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
        params![
            quote.number.trim(),
            quote.client_id,
            quote.site_address,
            quote.site_postal_code,
            quote.site_city,
            quote.surface_m2,
            quote.quote_date,
            quote.valid_until,
            quote.status,
            quote.total_ht,
            quote.vat_10,
            quote.vat_20,
            total_ttc,
            quote.energy_before,
            quote.energy_after,
            is_thermal_leak(quote.energy_before, quote.energy_after),
            w.now(),
        ],
    )?;
    let id = w.last_insert_rowid();
    metrics::on_quote_changed(w, None, quote.client_id)?;
    Ok(id)
}

pub fn get_quote(conn: &Connection, id: i64) -> Result<Option<Quote>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {QUOTE_COLUMNS} FROM quotes WHERE id = ?1"),
        params![id],
        quote_from_row,
    )
    .optional()
}

pub fn get_quote_by_number(conn: &Connection, number: &str) -> Result<Option<Quote>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {QUOTE_COLUMNS} FROM quotes WHERE number = ?1"),
        params![number],
        quote_from_row,
    )
    .optional()
}

pub fn quote_id_by_number(conn: &Connection, number: &str) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT id FROM quotes WHERE number = ?1",
        params![number],
        |row| row.get(0),
    )
    .optional()
}

/// Apply a partial update. The post-tax total follows the pre-tax and VAT
/// amounts unless given explicitly, and the thermal flag follows the energy
/// ratings. When an owner-visible field changes, both the previous and the
/// new owning client are recomputed in the same transaction.
pub fn update_quote(w: &Write<'_>, id: i64, patch: &QuotePatch) -> Result<Quote> {
    let old = get_quote(w, id)?.ok_or_else(|| Error::NotFound(format!("quote {id}")))?;
    let mut new = old.clone();

    if let Some(status) = patch.status {
        new.status = status;
    }
    if let Some(date) = patch.quote_date {
        new.quote_date = date;
    }
    if let Some(client_id) = patch.client_id {
        new.client_id = client_id;
    }
    if let Some(v) = patch.total_ht {
        new.total_ht = v;
    }
    if let Some(v) = patch.vat_10 {
        new.vat_10 = v;
    }
    if let Some(v) = patch.vat_20 {
        new.vat_20 = v;
    }
    let amounts_changed = patch.total_ht.is_some() || patch.vat_10.is_some() || patch.vat_20.is_some();
    new.total_ttc = match patch.total_ttc {
        Some(v) => v,
        None if amounts_changed => new.total_ht + new.vat_10 + new.vat_20,
        None => old.total_ttc,
    };
    if let Some(code) = &patch.site_postal_code {
        new.site_postal_code = code.clone();
    }
    if let Some(rating) = patch.energy_before {
        new.energy_before = rating;
    }
    if let Some(rating) = patch.energy_after {
        new.energy_after = rating;
    }
    new.is_thermal_leak = is_thermal_leak(new.energy_before, new.energy_after);
    validate_amounts(&[
        ("total_ht", new.total_ht),
        ("vat_10", new.vat_10),
        ("vat_20", new.vat_20),
        ("total_ttc", new.total_ttc),
    ])?;

    w.execute(
        "UPDATE quotes SET
           status = ?2, quote_date = ?3, client_id = ?4, total_ht = ?5, vat_10 = ?6, vat_20 = ?7,
           total_ttc = ?8, site_postal_code = ?9, energy_before = ?10, energy_after = ?11,
           is_thermal_leak = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            id,
            new.status,
            new.quote_date,
            new.client_id,
            new.total_ht,
            new.vat_10,
            new.vat_20,
            new.total_ttc,
            new.site_postal_code,
            new.energy_before,
            new.energy_after,
            new.is_thermal_leak,
            w.now(),
        ],
    )?;
    new.updated_at = w.now();

    let owner_visible = old.status != new.status
        || old.client_id != new.client_id
        || old.total_ht != new.total_ht
        || old.total_ttc != new.total_ttc;
    if owner_visible {
        metrics::on_quote_changed(w, old.client_id, new.client_id)?;
    }
    Ok(new)
}

/// Mark a quote deleted and recompute its client. Returns false if it was
/// already deleted or absent.
pub fn soft_delete_quote(w: &Write<'_>, id: i64) -> Result<bool> {
    set_quote_deleted(w, id, true)
}

pub fn restore_quote(w: &Write<'_>, id: i64) -> Result<bool> {
    set_quote_deleted(w, id, false)
}

fn set_quote_deleted(w: &Write<'_>, id: i64, deleted: bool) -> Result<bool> {
    let client_id: Option<Option<i64>> = w
        .query_row(
            "SELECT client_id FROM quotes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(client_id) = client_id else {
        return Ok(false);
    };

    let sql = if deleted {
        format!(
            "UPDATE quotes AS q SET deleted_at = ?2, updated_at = ?2
             WHERE q.id = ?1 AND {ACTIVE_QUOTE_SQL}"
        )
    } else {
        format!(
            "UPDATE quotes AS q SET deleted_at = NULL, updated_at = ?2
             WHERE q.id = ?1 AND NOT ({ACTIVE_QUOTE_SQL})"
        )
    };
    let count = w.execute(&sql, params![id, w.now()])?;
    if count > 0 {
        metrics::on_quote_changed(w, client_id, client_id)?;
    }
    Ok(count > 0)
}

/// Remove a quote with its work areas, line items and payments.
pub fn delete_quote(w: &Write<'_>, id: i64) -> Result<bool> {
    let client_id: Option<Option<i64>> = w
        .query_row(
            "SELECT client_id FROM quotes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(client_id) = client_id else {
        return Ok(false);
    };
    w.execute("DELETE FROM quotes WHERE id = ?1", params![id])?;
    metrics::on_quote_changed(w, client_id, client_id)?;
    Ok(true)
}

pub fn list_quotes(conn: &Connection, include_deleted: bool) -> Result<Vec<Quote>, rusqlite::Error> {
    let filter = if include_deleted {
        String::new()
    } else {
        format!("WHERE {ACTIVE_QUOTE_SQL}")
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUOTE_COLUMNS} FROM quotes q {filter} ORDER BY q.quote_date, q.id"
    ))?;
    let rows = stmt.query_map([], quote_from_row)?;
    rows.collect()
}

/// Every quote owned by the client, deleted ones included.
pub fn list_quote_facts_for_client(
    conn: &Connection,
    client_id: i64,
) -> Result<Vec<QuoteFacts>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT status, total_ht, total_ttc, deleted_at FROM quotes WHERE client_id = ?1",
    )?;
    let rows = stmt.query_map(params![client_id], |row| {
        Ok(QuoteFacts {
            status: row.get(0)?,
            total_ht: row.get(1)?,
            total_ttc: row.get(2)?,
            deleted_at: row.get(3)?,
        })
    })?;
    rows.collect()
}

// ── Work Areas ─────────────────────────────────────────────────────

pub fn insert_work_area(w: &Write<'_>, area: &NewWorkArea) -> Result<i64> {
    require(!area.name.trim().is_empty(), "work area name must not be empty")?;
    w.execute(
        "INSERT INTO work_areas (quote_id, name, surface_m2, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![area.quote_id, area.name.trim(), area.surface_m2, w.now()],
    )?;
    Ok(w.last_insert_rowid())
}

pub fn find_work_area_id(
    conn: &Connection,
    quote_id: i64,
    name: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT id FROM work_areas WHERE quote_id = ?1 AND name = ?2 ORDER BY id LIMIT 1",
        params![quote_id, name],
        |row| row.get(0),
    )
    .optional()
}

pub fn list_work_areas(conn: &Connection, quote_id: i64) -> Result<Vec<WorkArea>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, quote_id, name, surface_m2, created_at, updated_at
         FROM work_areas WHERE quote_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![quote_id], |row| {
        Ok(WorkArea {
            id: row.get(0)?,
            quote_id: row.get(1)?,
            name: row.get(2)?,
            surface_m2: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    })?;
    rows.collect()
}

/// Remove a work area; its line items stay on the quote, detached.
pub fn delete_work_area(w: &Write<'_>, id: i64) -> Result<bool> {
    w.execute(
        "UPDATE line_items SET updated_at = ?2 WHERE work_area_id = ?1",
        params![id, w.now()],
    )?;
    let count = w.execute("DELETE FROM work_areas WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

// ── Line Items ─────────────────────────────────────────────────────

const LINE_ITEM_COLUMNS: &str = "id, quote_id, work_area_id, line_number, designation, category, \
     sub_category, quantity, unit, unit_price_ht, vat_rate, total_ht, created_at, updated_at";

fn line_item_from_row(row: &Row<'_>) -> rusqlite::Result<LineItem> {
    Ok(LineItem {
        id: row.get(0)?,
        quote_id: row.get(1)?,
        work_area_id: row.get(2)?,
        line_number: row.get(3)?,
        designation: row.get(4)?,
        category: row.get(5)?,
        sub_category: row.get(6)?,
        quantity: row.get(7)?,
        unit: row.get(8)?,
        unit_price_ht: row.get(9)?,
        vat_rate: row.get(10)?,
        total_ht: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Insert a line item. Its work area, if any, must belong to the same quote.
pub fn insert_line_item(w: &Write<'_>, item: &NewLineItem) -> Result<i64> {
    require(!item.category.trim().is_empty(), "line item category must not be empty")?;
    if let Some(area_id) = item.work_area_id {
        let owner: Option<i64> = w
            .query_row(
                "SELECT quote_id FROM work_areas WHERE id = ?1",
                params![area_id],
                |row| row.get(0),
            )
            .optional()?;
        require(
            owner == Some(item.quote_id),
            &format!("work area {area_id} does not belong to quote {}", item.quote_id),
        )?;
    }
    w.execute(
        "INSERT INTO line_items (
            quote_id, work_area_id, line_number, designation, category, sub_category,
            quantity, unit, unit_price_ht, vat_rate, total_ht, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            item.quote_id,
            item.work_area_id,
            item.line_number,
            item.designation,
            item.category.trim(),
            item.sub_category,
            item.quantity,
            item.unit,
            item.unit_price_ht,
            item.vat_rate,
            item.total_ht,
            w.now(),
        ],
    )?;
    Ok(w.last_insert_rowid())
}

pub fn list_line_items(conn: &Connection, quote_id: i64) -> Result<Vec<LineItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINE_ITEM_COLUMNS} FROM line_items WHERE quote_id = ?1
         ORDER BY line_number, id"
    ))?;
    let rows = stmt.query_map(params![quote_id], line_item_from_row)?;
    rows.collect()
}

pub fn list_all_line_items(conn: &Connection) -> Result<Vec<LineItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINE_ITEM_COLUMNS} FROM line_items ORDER BY quote_id, id"
    ))?;
    let rows = stmt.query_map([], line_item_from_row)?;
    rows.collect()
}

pub fn delete_line_item(w: &Write<'_>, id: i64) -> Result<bool> {
    let count = w.execute("DELETE FROM line_items WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

// ── Payments ───────────────────────────────────────────────────────

pub fn insert_payment(w: &Write<'_>, payment: &NewPayment) -> Result<i64> {
    validate_amounts(&[("amount", payment.amount)])?;
    w.execute(
        "INSERT INTO payments (
            quote_id, client_id, amount, method, status, paid_at, transaction_ref,
            external_order_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            payment.quote_id,
            payment.client_id,
            payment.amount,
            payment.method,
            payment.status,
            payment.paid_at,
            payment.transaction_ref,
            payment.external_order_id,
            w.now(),
        ],
    )?;
    Ok(w.last_insert_rowid())
}

pub fn list_payments(conn: &Connection, quote_id: i64) -> Result<Vec<Payment>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, quote_id, client_id, amount, method, status, paid_at, transaction_ref,
                external_order_id, created_at, updated_at
         FROM payments WHERE quote_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![quote_id], |row| {
        Ok(Payment {
            id: row.get(0)?,
            quote_id: row.get(1)?,
            client_id: row.get(2)?,
            amount: row.get(3)?,
            method: row.get(4)?,
            status: row.get(5)?,
            paid_at: row.get(6)?,
            transaction_ref: row.get(7)?,
            external_order_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })?;
    rows.collect()
}

pub fn update_payment_status(w: &Write<'_>, id: i64, status: PaymentStatus) -> Result<()> {
    let count = w.execute(
        "UPDATE payments SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status, w.now()],
    )?;
    if count == 0 {
        return Err(Error::NotFound(format!("payment {id}")));
    }
    Ok(())
}

pub fn delete_payment(w: &Write<'_>, id: i64) -> Result<bool> {
    let count = w.execute("DELETE FROM payments WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub clients: u64,
    pub deleted_clients: u64,
    pub quotes: u64,
    pub deleted_quotes: u64,
    /// Active quotes with no active owner. They count in global KPIs but in
    /// no client segment.
    pub unassigned_quotes: u64,
    pub line_items: u64,
    pub payments: u64,
}

pub fn store_counts(conn: &Connection) -> Result<StoreCounts, rusqlite::Error> {
    let sql = format!(
        "SELECT
           (SELECT COUNT(*) FROM clients c WHERE {ACTIVE_CLIENT_SQL}),
           (SELECT COUNT(*) FROM clients c WHERE NOT ({ACTIVE_CLIENT_SQL})),
           (SELECT COUNT(*) FROM quotes q WHERE {ACTIVE_QUOTE_SQL}),
           (SELECT COUNT(*) FROM quotes q WHERE NOT ({ACTIVE_QUOTE_SQL})),
           (SELECT COUNT(*) FROM quotes q
              LEFT JOIN clients c ON c.id = q.client_id AND {ACTIVE_CLIENT_SQL}
              WHERE {ACTIVE_QUOTE_SQL} AND c.id IS NULL),
           (SELECT COUNT(*) FROM line_items),
           (SELECT COUNT(*) FROM payments)"
    );
    conn.query_row(&sql, [], |row| {
        Ok(StoreCounts {
            clients: row.get::<_, i64>(0)? as u64,
            deleted_clients: row.get::<_, i64>(1)? as u64,
            quotes: row.get::<_, i64>(2)? as u64,
            deleted_quotes: row.get::<_, i64>(3)? as u64,
            unassigned_quotes: row.get::<_, i64>(4)? as u64,
            line_items: row.get::<_, i64>(5)? as u64,
            payments: row.get::<_, i64>(6)? as u64,
        })
    })
}

// ── Snapshots ──────────────────────────────────────────────────────

pub fn get_refresh_state(conn: &Connection) -> Result<Option<Watermark>, rusqlite::Error> {
    conn.query_row(
        "SELECT version, refreshed_at, duration_ms FROM refresh_state WHERE id = 1",
        [],
        |row| {
            Ok(Watermark {
                version: row.get(0)?,
                refreshed_at: row.get(1)?,
                duration_ms: row.get::<_, i64>(2)? as u64,
            })
        },
    )
    .optional()
}

/// Swap all three dashboard snapshots and advance the watermark. Callers
/// run this inside one write, so readers see either the previous set or
/// this one.
pub fn replace_dashboard_snapshots(
    w: &Write<'_>,
    dashboard: &DashboardSnapshots,
    watermark: &Watermark,
) -> Result<()> {
    let version = watermark.version;
    let as_of = watermark.refreshed_at;

    w.execute("DELETE FROM snapshot_global_kpis", [])?;
    w.execute("DELETE FROM snapshot_client_segments", [])?;
    w.execute("DELETE FROM snapshot_top_categories", [])?;

    let g = &dashboard.global;
    w.execute(
        "INSERT INTO snapshot_global_kpis (
            id, version, as_of, total_quotes, total_ht, total_ttc, distinct_clients,
            thermal_leak_count, thermal_leak_pct
        ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            version,
            as_of,
            g.total_quotes as i64,
            g.total_ht,
            g.total_ttc,
            g.distinct_clients as i64,
            g.thermal_leak_count as i64,
            g.thermal_leak_pct,
        ],
    )?;

    {
        let mut stmt = w.prepare(
            "INSERT INTO snapshot_client_segments (
                client_type, version, as_of, client_count, client_pct, revenue_ht
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for seg in &dashboard.segments {
            stmt.execute(params![
                seg.client_type,
                version,
                as_of,
                seg.client_count as i64,
                seg.client_pct,
                seg.revenue_ht,
            ])?;
        }
    }

    {
        let mut stmt = w.prepare(
            "INSERT INTO snapshot_top_categories (
                category, version, as_of, rank, line_count, avg_line_value, total_ht, share_pct
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for cat in &dashboard.top_categories {
            stmt.execute(params![
                cat.category,
                version,
                as_of,
                cat.rank,
                cat.line_count as i64,
                cat.avg_line_value,
                cat.total_ht,
                cat.share_pct,
            ])?;
        }
    }

    w.execute(
        "INSERT INTO refresh_state (id, version, refreshed_at, duration_ms)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
           version = excluded.version,
           refreshed_at = excluded.refreshed_at,
           duration_ms = excluded.duration_ms",
        params![version, as_of, watermark.duration_ms as i64],
    )?;
    Ok(())
}

pub fn get_global_kpis(conn: &Connection) -> Result<Option<Snapshot<GlobalKpis>>, rusqlite::Error> {
    conn.query_row(
        "SELECT version, as_of, total_quotes, total_ht, total_ttc, distinct_clients,
                thermal_leak_count, thermal_leak_pct
         FROM snapshot_global_kpis WHERE id = 1",
        [],
        |row| {
            Ok(Snapshot {
                version: row.get(0)?,
                as_of: row.get(1)?,
                data: GlobalKpis {
                    total_quotes: row.get::<_, i64>(2)? as u64,
                    total_ht: row.get(3)?,
                    total_ttc: row.get(4)?,
                    distinct_clients: row.get::<_, i64>(5)? as u64,
                    thermal_leak_count: row.get::<_, i64>(6)? as u64,
                    thermal_leak_pct: row.get(7)?,
                },
            })
        },
    )
    .optional()
}

/// Segment rows of the last refresh. The snapshot exists (possibly empty)
/// once any refresh has completed.
pub fn get_client_segments(
    conn: &Connection,
) -> Result<Option<Snapshot<Vec<ClientSegment>>>, rusqlite::Error> {
    let Some(state) = get_refresh_state(conn)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT client_type, client_count, client_pct, revenue_ht FROM snapshot_client_segments",
    )?;
    let mut segments = stmt
        .query_map([], |row| {
            Ok(ClientSegment {
                client_type: row.get(0)?,
                client_count: row.get::<_, i64>(1)? as u64,
                client_pct: row.get(2)?,
                revenue_ht: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    segments.sort_by_key(|s| s.client_type);
    Ok(Some(Snapshot {
        version: state.version,
        as_of: state.refreshed_at,
        data: segments,
    }))
}

pub fn get_top_categories(
    conn: &Connection,
    limit: Option<usize>,
) -> Result<Option<Snapshot<Vec<WorkCategoryStat>>>, rusqlite::Error> {
    let Some(state) = get_refresh_state(conn)? else {
        return Ok(None);
    };
    // SQLite treats a negative LIMIT as unbounded.
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT rank, category, line_count, avg_line_value, total_ht, share_pct
         FROM snapshot_top_categories ORDER BY rank LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(WorkCategoryStat {
                rank: row.get(0)?,
                category: row.get(1)?,
                line_count: row.get::<_, i64>(2)? as u64,
                avg_line_value: row.get(3)?,
                total_ht: row.get(4)?,
                share_pct: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Snapshot {
        version: state.version,
        as_of: state.refreshed_at,
        data: rows,
    }))
}

// ── Refresh Lease ──────────────────────────────────────────────────

pub fn get_refresh_lease(conn: &Connection) -> Result<Option<RefreshLease>, rusqlite::Error> {
    conn.query_row(
        "SELECT holder, acquired_at, expires_at FROM refresh_lease WHERE id = 1",
        [],
        |row| {
            Ok(RefreshLease {
                holder: row.get(0)?,
                acquired_at: row.get(1)?,
                expires_at: row.get(2)?,
            })
        },
    )
    .optional()
}

/// Take the refresh lease for `holder` until `expires_at`. Another holder's
/// unexpired lease makes this fail with [`Error::RefreshInProgress`]; an
/// expired one is taken over.
pub fn claim_refresh_lease(w: &Write<'_>, holder: &str, expires_at: DateTime<Utc>) -> Result<()> {
    if let Some(current) = get_refresh_lease(w)? {
        if current.holder != holder {
            if current.expires_at > w.now() {
                log::warn!(
                    "Refresh rejected: lease held by {} until {}",
                    current.holder,
                    current.expires_at
                );
                return Err(Error::RefreshInProgress);
            }
            log::warn!(
                "Taking over refresh lease from {} (expired {})",
                current.holder,
                current.expires_at
            );
        }
    }
    w.execute(
        "INSERT INTO refresh_lease (id, holder, acquired_at, expires_at) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
           holder = excluded.holder,
           acquired_at = excluded.acquired_at,
           expires_at = excluded.expires_at",
        params![holder, w.now(), expires_at],
    )?;
    Ok(())
}

pub fn holds_refresh_lease(conn: &Connection, holder: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM refresh_lease WHERE id = 1 AND holder = ?1)",
        params![holder],
        |row| row.get(0),
    )
}

/// Drop the lease if `holder` still has it. Returns false if it was taken
/// over in the meantime.
pub fn release_refresh_lease(w: &Write<'_>, holder: &str) -> Result<bool> {
    let count = w.execute(
        "DELETE FROM refresh_lease WHERE id = 1 AND holder = ?1",
        params![holder],
    )?;
    Ok(count > 0)
}

// ── Trend Rollups ──────────────────────────────────────────────────

/// Make the stored rows for `(period_type, period_date)` exactly `stats`:
/// keys no longer produced are removed, the rest upserted.
pub fn upsert_work_type_stats(
    w: &Write<'_>,
    period_type: PeriodType,
    period_date: NaiveDate,
    stats: &[WorkTypeStat],
) -> Result<()> {
    let keep: Vec<&str> = stats.iter().map(|s| s.category.as_str()).collect();
    delete_stale_keys(w, "work_type_stats", "category", period_type, period_date, &keep)?;

    let mut stmt = w.prepare(
        "INSERT INTO work_type_stats (
            category, period_type, period_date, quote_count, line_count, total_ht,
            avg_line_ht, evolution_pct, trend, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(category, period_type, period_date) DO UPDATE SET
            quote_count = excluded.quote_count,
            line_count = excluded.line_count,
            total_ht = excluded.total_ht,
            avg_line_ht = excluded.avg_line_ht,
            evolution_pct = excluded.evolution_pct,
            trend = excluded.trend,
            updated_at = excluded.updated_at",
    )?;
    for s in stats {
        stmt.execute(params![
            s.category,
            period_type,
            period_date,
            s.quote_count as i64,
            s.line_count as i64,
            s.total_ht,
            s.avg_line_ht,
            s.evolution_pct,
            s.trend,
            s.updated_at,
        ])?;
    }
    Ok(())
}

pub fn get_work_type_stats(
    conn: &Connection,
    period_type: PeriodType,
    period_date: NaiveDate,
) -> Result<Vec<WorkTypeStat>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT category, period_type, period_date, quote_count, line_count, total_ht,
                avg_line_ht, evolution_pct, trend, updated_at
         FROM work_type_stats
         WHERE period_type = ?1 AND period_date = ?2
         ORDER BY total_ht DESC, category",
    )?;
    let rows = stmt.query_map(params![period_type, period_date], |row| {
        Ok(WorkTypeStat {
            category: row.get(0)?,
            period_type: row.get(1)?,
            period_date: row.get(2)?,
            quote_count: row.get::<_, i64>(3)? as u64,
            line_count: row.get::<_, i64>(4)? as u64,
            total_ht: row.get(5)?,
            avg_line_ht: row.get(6)?,
            evolution_pct: row.get(7)?,
            trend: row.get(8)?,
            updated_at: row.get(9)?,
        })
    })?;
    rows.collect()
}

pub fn upsert_region_stats(
    w: &Write<'_>,
    period_type: PeriodType,
    period_date: NaiveDate,
    stats: &[RegionStat],
) -> Result<()> {
    let keep: Vec<&str> = stats.iter().map(|s| s.region.as_str()).collect();
    delete_stale_keys(w, "region_stats", "region", period_type, period_date, &keep)?;

    let mut stmt = w.prepare(
        "INSERT INTO region_stats (
            region, period_type, period_date, quote_count, accepted_count, total_ht,
            avg_quote_ht, conversion_rate, evolution_pct, trend, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(region, period_type, period_date) DO UPDATE SET
            quote_count = excluded.quote_count,
            accepted_count = excluded.accepted_count,
            total_ht = excluded.total_ht,
            avg_quote_ht = excluded.avg_quote_ht,
            conversion_rate = excluded.conversion_rate,
            evolution_pct = excluded.evolution_pct,
            trend = excluded.trend,
            updated_at = excluded.updated_at",
    )?;
    for s in stats {
        stmt.execute(params![
            s.region,
            period_type,
            period_date,
            s.quote_count as i64,
            s.accepted_count as i64,
            s.total_ht,
            s.avg_quote_ht,
            s.conversion_rate,
            s.evolution_pct,
            s.trend,
            s.updated_at,
        ])?;
    }
    Ok(())
}

pub fn get_region_stats(
    conn: &Connection,
    period_type: PeriodType,
    period_date: NaiveDate,
) -> Result<Vec<RegionStat>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT region, period_type, period_date, quote_count, accepted_count, total_ht,
                avg_quote_ht, conversion_rate, evolution_pct, trend, updated_at
         FROM region_stats
         WHERE period_type = ?1 AND period_date = ?2
         ORDER BY total_ht DESC, region",
    )?;
    let rows = stmt.query_map(params![period_type, period_date], |row| {
        Ok(RegionStat {
            region: row.get(0)?,
            period_type: row.get(1)?,
            period_date: row.get(2)?,
            quote_count: row.get::<_, i64>(3)? as u64,
            accepted_count: row.get::<_, i64>(4)? as u64,
            total_ht: row.get(5)?,
            avg_quote_ht: row.get(6)?,
            conversion_rate: row.get(7)?,
            evolution_pct: row.get(8)?,
            trend: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })?;
    rows.collect()
}

fn delete_stale_keys(
    w: &Write<'_>,
    table: &str,
    key_column: &str,
    period_type: PeriodType,
    period_date: NaiveDate,
    keep: &[&str],
) -> Result<()> {
    let existing: Vec<String> = {
        let mut stmt = w.prepare(&format!(
            "SELECT {key_column} FROM {table} WHERE period_type = ?1 AND period_date = ?2"
        ))?;
        let rows = stmt.query_map(params![period_type, period_date], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for key in existing.iter().filter(|k| !keep.contains(&k.as_str())) {
        w.execute(
            &format!(
                "DELETE FROM {table} WHERE {key_column} = ?1 AND period_type = ?2 AND period_date = ?3"
            ),
            params![key, period_type, period_date],
        )?;
    }
    Ok(())
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(w: &Write<'_>, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    w.execute(
        "INSERT INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, w.now()],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

fn require(cond: bool, msg: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::ConstraintViolation(msg.to_string()))
    }
}
