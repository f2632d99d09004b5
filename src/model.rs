//! Records owned by the record store, and the closed label sets they use.
//!
//! Every enumeration is stored as its upper-case label and validated on the
//! way in: an unknown label is a [`Error::ConstraintViolation`], never a
//! silent default.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Declares a closed label enum with `as_str`/`parse` and SQLite conversions.
macro_rules! label_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn parse(s: &str) -> Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    _ => Err(Error::ConstraintViolation(format!(
                        "invalid {}: {s:?}",
                        $what
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                $name::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

label_enum!(
    /// Commercial segment of a client.
    ClientType, "client type" {
        ProRealEstate => "PRO_REAL_ESTATE",
        ProConstruction => "PRO_CONSTRUCTION",
        Individual => "INDIVIDUAL",
    }
);

label_enum!(
    QuoteStatus, "quote status" {
        Pending => "PENDING",
        Accepted => "ACCEPTED",
        Rejected => "REJECTED",
        Expired => "EXPIRED",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
    }
);

label_enum!(
    /// Energy performance class, `A` (best) through `G` (worst).
    EnergyRating, "energy rating" {
        A => "A",
        B => "B",
        C => "C",
        D => "D",
        E => "E",
        F => "F",
        G => "G",
    }
);

label_enum!(
    PaymentMethod, "payment method" {
        Card => "CARD",
        Transfer => "TRANSFER",
        Check => "CHECK",
        Cash => "CASH",
        Stripe => "STRIPE",
        Paypal => "PAYPAL",
    }
);

label_enum!(
    PaymentStatus, "payment status" {
        Pending => "PENDING",
        Validated => "VALIDATED",
        Failed => "FAILED",
        Refunded => "REFUNDED",
    }
);

label_enum!(
    TrendDirection, "trend direction" {
        Up => "UP",
        Down => "DOWN",
        Stable => "STABLE",
    }
);

label_enum!(
    /// Granularity of a trend rollup bucket.
    PeriodType, "period type" {
        Week => "WEEK",
        Month => "MONTH",
        Quarter => "QUARTER",
        Year => "YEAR",
    }
);

impl EnergyRating {
    /// F and G are the "passoire" band.
    pub fn is_leaky(&self) -> bool {
        matches!(self, EnergyRating::F | EnergyRating::G)
    }
}

/// A property is a thermal leak when it starts in the F/G band and the
/// planned works do not bring it out of that band.
pub fn is_thermal_leak(before: Option<EnergyRating>, after: Option<EnergyRating>) -> bool {
    match (before, after) {
        (Some(b), None) => b.is_leaky(),
        (Some(b), Some(a)) => b.is_leaky() && a.is_leaky(),
        (None, _) => false,
    }
}

pub const UNKNOWN_REGION: &str = "UNKNOWN";

/// Département code for a French postal code.
pub fn region_of(postal_code: Option<&str>) -> String {
    let code = match postal_code.map(str::trim) {
        Some(c) if c.len() == 5 && c.chars().all(|ch| ch.is_ascii_digit()) => c,
        _ => return UNKNOWN_REGION.to_string(),
    };
    if let Some(rest) = code.strip_prefix("20") {
        // Corsica: 200xx-201xx is Corse-du-Sud, the rest Haute-Corse.
        return if rest < "200" { "2A" } else { "2B" }.to_string();
    }
    if code.starts_with("97") || code.starts_with("98") {
        return code[..3].to_string();
    }
    code[..2].to_string()
}

/// [`region_of`] as a SQL expression over `q.site_postal_code`.
pub const REGION_SQL: &str = "CASE
    WHEN q.site_postal_code IS NULL
        OR length(trim(q.site_postal_code)) != 5
        OR trim(q.site_postal_code) GLOB '*[^0-9]*' THEN 'UNKNOWN'
    WHEN substr(trim(q.site_postal_code), 1, 2) = '20' THEN
        CASE WHEN substr(trim(q.site_postal_code), 3) < '200' THEN '2A' ELSE '2B' END
    WHEN substr(trim(q.site_postal_code), 1, 2) IN ('97', '98')
        THEN substr(trim(q.site_postal_code), 1, 3)
    ELSE substr(trim(q.site_postal_code), 1, 2)
END";

// ── Records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub client_type: ClientType,
    pub external_id: Option<i64>,
    pub quote_count: i64,
    pub revenue_ht: f64,
    pub revenue_ttc: f64,
    pub conversion_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub client_type: ClientType,
    #[serde(default)]
    pub external_id: Option<i64>,
}

impl NewClient {
    pub fn new(name: &str, client_type: ClientType) -> Self {
        Self {
            name: name.to_string(),
            first_name: None,
            email: None,
            phone: None,
            address: None,
            postal_code: None,
            city: None,
            client_type,
            external_id: None,
        }
    }
}

/// Contact-level changes to a client. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientPatch {
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub client_type: Option<ClientType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub id: i64,
    pub number: String,
    pub client_id: Option<i64>,
    pub site_address: Option<String>,
    pub site_postal_code: Option<String>,
    pub site_city: Option<String>,
    pub surface_m2: Option<f64>,
    pub quote_date: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub status: QuoteStatus,
    pub total_ht: f64,
    pub vat_10: f64,
    pub vat_20: f64,
    pub total_ttc: f64,
    pub energy_before: Option<EnergyRating>,
    pub energy_after: Option<EnergyRating>,
    pub is_thermal_leak: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewQuote {
    pub number: String,
    pub client_id: Option<i64>,
    pub site_address: Option<String>,
    pub site_postal_code: Option<String>,
    pub site_city: Option<String>,
    pub surface_m2: Option<f64>,
    pub quote_date: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub status: QuoteStatus,
    pub total_ht: f64,
    pub vat_10: f64,
    pub vat_20: f64,
    /// Defaults to `total_ht + vat_10 + vat_20` when absent.
    pub total_ttc: Option<f64>,
    pub energy_before: Option<EnergyRating>,
    pub energy_after: Option<EnergyRating>,
}

impl NewQuote {
    pub fn new(number: &str, client_id: Option<i64>, quote_date: NaiveDate) -> Self {
        Self {
            number: number.to_string(),
            client_id,
            site_address: None,
            site_postal_code: None,
            site_city: None,
            surface_m2: None,
            quote_date,
            valid_until: None,
            status: QuoteStatus::Pending,
            total_ht: 0.0,
            vat_10: 0.0,
            vat_20: 0.0,
            total_ttc: None,
            energy_before: None,
            energy_after: None,
        }
    }

    pub fn total_ttc(&self) -> f64 {
        self.total_ttc
            .unwrap_or(self.total_ht + self.vat_10 + self.vat_20)
    }
}

/// Partial update of a quote. `None` leaves a field untouched; the nested
/// `Option`s distinguish "clear" from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct QuotePatch {
    pub status: Option<QuoteStatus>,
    pub quote_date: Option<NaiveDate>,
    pub client_id: Option<Option<i64>>,
    pub total_ht: Option<f64>,
    pub vat_10: Option<f64>,
    pub vat_20: Option<f64>,
    pub total_ttc: Option<f64>,
    pub site_postal_code: Option<Option<String>>,
    pub energy_before: Option<Option<EnergyRating>>,
    pub energy_after: Option<Option<EnergyRating>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkArea {
    pub id: i64,
    pub quote_id: i64,
    pub name: String,
    pub surface_m2: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkArea {
    pub quote_id: i64,
    pub name: String,
    pub surface_m2: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub id: i64,
    pub quote_id: i64,
    pub work_area_id: Option<i64>,
    pub line_number: Option<i64>,
    pub designation: String,
    pub category: String,
    pub sub_category: Option<String>,
    pub quantity: f64,
    pub unit: Option<String>,
    pub unit_price_ht: f64,
    pub vat_rate: f64,
    pub total_ht: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub quote_id: i64,
    pub work_area_id: Option<i64>,
    pub line_number: Option<i64>,
    pub designation: String,
    pub category: String,
    pub sub_category: Option<String>,
    pub quantity: f64,
    pub unit: Option<String>,
    pub unit_price_ht: f64,
    pub vat_rate: f64,
    /// Authoritative line total; stored as given.
    pub total_ht: f64,
}

impl NewLineItem {
    pub fn new(quote_id: i64, category: &str, quantity: f64, unit_price_ht: f64) -> Self {
        Self {
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
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: i64,
    pub quote_id: i64,
    pub client_id: Option<i64>,
    pub amount: f64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub transaction_ref: Option<String>,
    pub external_order_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub quote_id: i64,
    pub client_id: Option<i64>,
    pub amount: f64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub transaction_ref: Option<String>,
    pub external_order_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        assert_eq!(
            ClientType::parse("pro_real_estate").unwrap(),
            ClientType::ProRealEstate
        );
        assert_eq!(QuoteStatus::parse(" IN_PROGRESS ").unwrap(), QuoteStatus::InProgress);
        assert_eq!(EnergyRating::parse("g").unwrap(), EnergyRating::G);
        assert_eq!(PaymentMethod::parse("PAYPAL").unwrap(), PaymentMethod::Paypal);
    }

    #[test]
    fn test_parse_rejects_unknown_label() {
        let err = QuoteStatus::parse("ARCHIVED").unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
        assert!(EnergyRating::parse("H").is_err());
        assert!(PaymentStatus::parse("").is_err());
    }

    #[test]
    fn test_serde_uses_labels() {
        let json = serde_json::to_string(&ClientType::ProConstruction).unwrap();
        assert_eq!(json, "\"PRO_CONSTRUCTION\"");
        let status: QuoteStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(status, QuoteStatus::InProgress);
    }

    #[test]
    fn test_thermal_leak() {
        use EnergyRating::*;
        assert!(is_thermal_leak(Some(G), None));
        assert!(is_thermal_leak(Some(F), Some(G)));
        assert!(!is_thermal_leak(Some(G), Some(C)));
        assert!(!is_thermal_leak(Some(D), None));
        assert!(!is_thermal_leak(None, Some(G)));
    }

    #[test]
    fn test_region_of() {
        assert_eq!(region_of(Some("75011")), "75");
        assert_eq!(region_of(Some(" 06000 ")), "06");
        assert_eq!(region_of(Some("20000")), "2A");
        assert_eq!(region_of(Some("20200")), "2B");
        assert_eq!(region_of(Some("97400")), "974");
        assert_eq!(region_of(Some("7501")), UNKNOWN_REGION);
        assert_eq!(region_of(None), UNKNOWN_REGION);
    }

    #[test]
    fn test_region_sql_agrees_with_region_of() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let sql = format!("SELECT {REGION_SQL} FROM (SELECT ?1 AS site_postal_code) q");
        for code in [
            Some("75011"),
            Some(" 06000 "),
            Some("20000"),
            Some("20199"),
            Some("20200"),
            Some("97400"),
            Some("98800"),
            Some("7501"),
            Some("75O11"),
            None,
        ] {
            let got: String = conn.query_row(&sql, [code], |row| row.get(0)).unwrap();
            assert_eq!(got, region_of(code), "postal code {code:?}");
        }
    }

    #[test]
    fn test_new_quote_total_ttc_default() {
        let mut q = NewQuote::new("D-1", None, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        q.total_ht = 1000.0;
        q.vat_10 = 100.0;
        assert_eq!(q.total_ttc(), 1100.0);
        q.total_ttc = Some(1200.0);
        assert_eq!(q.total_ttc(), 1200.0);
    }
}
