use chrono::NaiveDate;
use serde::Serialize;

use crate::error::Result;
use crate::guard::ACTIVE_QUOTE_SQL;
use crate::model::{ClientType, QuoteStatus, REGION_SQL};
use crate::storage::Database;

/// A row from a quote query.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteRow {
    pub id: i64,
    pub number: String,
    pub client_id: Option<i64>,
    pub client_name: Option<String>,
    pub client_type: Option<ClientType>,
    pub quote_date: NaiveDate,
    pub status: QuoteStatus,
    pub total_ht: f64,
    pub total_ttc: f64,
    pub region: String,
    pub is_thermal_leak: bool,
    pub line_count: i64,
    pub deleted: bool,
}

/// Builder for filtered quote listings. Soft-deleted quotes are excluded
/// unless [`include_deleted`](Self::include_deleted) is set.
#[derive(Debug, Clone, Default)]
pub struct QuoteQuery {
    client_id: Option<i64>,
    status: Option<QuoteStatus>,
    date_after: Option<NaiveDate>,
    date_before: Option<NaiveDate>,
    region: Option<String>,
    thermal_leak: Option<bool>,
    include_deleted: bool,
    limit: Option<u32>,
    order_by: Option<String>,
    order_desc: bool,
}

impl QuoteQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, id: i64) -> Self {
        self.client_id = Some(id);
        self
    }

    pub fn status(mut self, status: QuoteStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Quotes dated on or after `date`.
    pub fn date_after(mut self, date: NaiveDate) -> Self {
        self.date_after = Some(date);
        self
    }

    /// Quotes dated on or before `date`.
    pub fn date_before(mut self, date: NaiveDate) -> Self {
        self.date_before = Some(date);
        self
    }

    pub fn region(mut self, code: &str) -> Self {
        self.region = Some(code.trim().to_ascii_uppercase());
        self
    }

    pub fn thermal_leak(mut self, val: bool) -> Self {
        self.thermal_leak = Some(val);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }

    /// One of `date`, `number`, `total`, `status`; anything else orders by date.
    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order_desc = true;
        self
    }

    /// Build and execute the query, returning quote rows.
    pub async fn quotes(self, db: &Database) -> Result<Vec<QuoteRow>> {
        let builder = self;
        db.read(move |conn| {
            let (sql, params) = builder.build_sql();
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), |row| {
                Ok(QuoteRow {
                    id: row.get(0)?,
                    number: row.get(1)?,
                    client_id: row.get(2)?,
                    client_name: row.get(3)?,
                    client_type: row.get(4)?,
                    quote_date: row.get(5)?,
                    status: row.get(6)?,
                    total_ht: row.get(7)?,
                    total_ttc: row.get(8)?,
                    region: row.get(9)?,
                    is_thermal_leak: row.get(10)?,
                    line_count: row.get(11)?,
                    deleted: row.get(12)?,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Build and execute the query, returning a count of matching quotes.
    pub async fn count(self, db: &Database) -> Result<u64> {
        let builder = self;
        db.read(move |conn| {
            let (inner_sql, params) = builder.build_sql();
            let sql = format!("SELECT COUNT(*) FROM ({inner_sql})");
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Build and execute the query, returning results as JSON.
    pub async fn to_json(self, db: &Database) -> Result<String> {
        let rows = self.quotes(db).await?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    /// Build and execute the query, returning results as CSV.
    pub async fn to_csv(self, db: &Database) -> Result<String> {
        let rows = self.quotes(db).await?;
        let mut out = String::new();
        out.push_str("id,number,client_id,client_name,client_type,quote_date,status,total_ht,total_ttc,region,is_thermal_leak,line_count,deleted\n");
        for row in &rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{:.2},{:.2},{},{},{},{}\n",
                row.id,
                csv_escape(&row.number),
                row.client_id.map_or(String::new(), |id| id.to_string()),
                csv_escape(row.client_name.as_deref().unwrap_or("")),
                row.client_type.map_or("", |t| t.as_str()),
                row.quote_date,
                row.status,
                row.total_ht,
                row.total_ttc,
                row.region,
                row.is_thermal_leak,
                row.line_count,
                row.deleted,
            ));
        }
        Ok(out)
    }

    fn build_sql(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut wheres = Vec::new();
        let mut param_idx = 1;

        let select = format!(
            "SELECT q.id, q.number, q.client_id, c.name AS client_name,
                c.client_type, q.quote_date, q.status, q.total_ht, q.total_ttc,
                {REGION_SQL} AS region, q.is_thermal_leak,
                (SELECT COUNT(*) FROM line_items l WHERE l.quote_id = q.id) AS line_count,
                NOT ({ACTIVE_QUOTE_SQL}) AS deleted
            FROM quotes q
            LEFT JOIN clients c ON c.id = q.client_id"
        );

        if !self.include_deleted {
            wheres.push(ACTIVE_QUOTE_SQL.to_string());
        }

        if let Some(id) = self.client_id {
            wheres.push(format!("q.client_id = ?{param_idx}"));
            params.push(Box::new(id));
            param_idx += 1;
        }

        if let Some(status) = self.status {
            wheres.push(format!("q.status = ?{param_idx}"));
            params.push(Box::new(status));
            param_idx += 1;
        }

        if let Some(date) = self.date_after {
            wheres.push(format!("q.quote_date >= ?{param_idx}"));
            params.push(Box::new(date));
            param_idx += 1;
        }
        if let Some(date) = self.date_before {
            wheres.push(format!("q.quote_date <= ?{param_idx}"));
            params.push(Box::new(date));
            param_idx += 1;
        }

        if let Some(ref region) = self.region {
            wheres.push(format!("{REGION_SQL} = ?{param_idx}"));
            params.push(Box::new(region.clone()));
            param_idx += 1;
        }

        if let Some(leak) = self.thermal_leak {
            wheres.push(format!("q.is_thermal_leak = ?{param_idx}"));
            params.push(Box::new(leak));
            param_idx += 1;
        }

        let mut sql = select;
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }

        let order_field = match self.order_by.as_deref() {
            Some("number") => "q.number",
            Some("total") => "q.total_ht",
            Some("status") => "q.status",
            _ => "q.quote_date",
        };
        let order_dir = if self.order_desc { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {order_field} {order_dir}, q.id {order_dir}"));

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT ?{param_idx}"));
            params.push(Box::new(limit));
        }

        (sql, params)
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
