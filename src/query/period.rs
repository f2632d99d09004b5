use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;

use crate::date_util::{last_day_of_month, quarter_of};
use crate::error::{Error, Result};
use crate::model::PeriodType;

static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// A calendar bucket for trend rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    /// ISO year and ISO week.
    Week(i32, u8),
    Month(i32, u8),
    Quarter(i32, u8),
    Year(i32),
}

impl Period {
    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `2025` — year
    /// - `2025-Q1` — quarter
    /// - `2025-01` — month
    /// - `2025-W05` — ISO week
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        // Year: "2025"
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        // Quarter: "2025-Q1" through "2025-Q4"
        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let q: u8 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, q));
        }

        // Week: "2025-W05"
        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let week: u8 = caps[2].parse().unwrap();
            if NaiveDate::from_isoywd_opt(year, week as u32, Weekday::Mon).is_some() {
                return Ok(Period::Week(year, week));
            }
        }

        // Month: "2025-01"
        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u8 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// The period of the given type that contains `date`.
    pub fn containing(period_type: PeriodType, date: NaiveDate) -> Self {
        match period_type {
            PeriodType::Week => {
                let iw = date.iso_week();
                Period::Week(iw.year(), iw.week() as u8)
            }
            PeriodType::Month => Period::Month(date.year(), date.month() as u8),
            PeriodType::Quarter => Period::Quarter(date.year(), quarter_of(date)),
            PeriodType::Year => Period::Year(date.year()),
        }
    }

    /// Rebuild a period from its stored `(period_type, period_date)` key.
    /// The date must be the first day of the period.
    pub fn from_type_and_date(period_type: PeriodType, period_date: NaiveDate) -> Result<Self> {
        let period = Self::containing(period_type, period_date);
        if period.period_date() != period_date {
            return Err(Error::PeriodParse(format!(
                "{period_date} does not start a {} period",
                period_type.as_str().to_lowercase()
            )));
        }
        Ok(period)
    }

    /// Convert to a canonical key string for display/lookup.
    pub fn to_key(&self) -> String {
        match self {
            Period::Year(y) => format!("{y}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Week(y, w) => format!("{y}-W{w:02}"),
        }
    }

    pub fn period_type(&self) -> PeriodType {
        match self {
            Period::Week(..) => PeriodType::Week,
            Period::Month(..) => PeriodType::Month,
            Period::Quarter(..) => PeriodType::Quarter,
            Period::Year(_) => PeriodType::Year,
        }
    }

    /// First day of the period; the `period_date` half of a rollup key.
    pub fn period_date(&self) -> NaiveDate {
        self.date_range().0
    }

    /// Get the date range (inclusive start, inclusive end) for this period.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        match self {
            Period::Year(y) => (
                NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
            ),
            Period::Quarter(y, q) => {
                let start_month = (*q as u32 - 1) * 3 + 1;
                let end_month = *q as u32 * 3;
                (
                    NaiveDate::from_ymd_opt(*y, start_month, 1).unwrap(),
                    last_day_of_month(*y, end_month),
                )
            }
            Period::Month(y, m) => (
                NaiveDate::from_ymd_opt(*y, *m as u32, 1).unwrap(),
                last_day_of_month(*y, *m as u32),
            ),
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon).unwrap();
                (start, start + Duration::days(6))
            }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        let (start, end) = self.date_range();
        date >= start && date <= end
    }

    /// Get the previous period of the same type.
    pub fn previous(&self) -> Self {
        match self {
            Period::Year(y) => Period::Year(y - 1),
            Period::Quarter(y, q) => {
                if *q == 1 {
                    Period::Quarter(y - 1, 4)
                } else {
                    Period::Quarter(*y, q - 1)
                }
            }
            Period::Month(y, m) => {
                if *m == 1 {
                    Period::Month(y - 1, 12)
                } else {
                    Period::Month(*y, m - 1)
                }
            }
            Period::Week(..) => {
                // ISO years have 52 or 53 weeks; step back through the calendar.
                Self::containing(PeriodType::Week, self.period_date() - Duration::days(7))
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_year() {
        assert_eq!(Period::parse("2025").unwrap(), Period::Year(2025));
    }

    #[test]
    fn test_parse_quarter() {
        assert_eq!(Period::parse("2025-Q1").unwrap(), Period::Quarter(2025, 1));
        assert_eq!(Period::parse("2025-Q4").unwrap(), Period::Quarter(2025, 4));
    }

    #[test]
    fn test_parse_month() {
        assert_eq!(Period::parse("2025-01").unwrap(), Period::Month(2025, 1));
        assert_eq!(Period::parse("2025-12").unwrap(), Period::Month(2025, 12));
    }

    #[test]
    fn test_parse_week() {
        assert_eq!(Period::parse("2025-W05").unwrap(), Period::Week(2025, 5));
        assert_eq!(Period::parse("2025-W1").unwrap(), Period::Week(2025, 1));
        // 2020 has 53 ISO weeks, 2025 does not.
        assert!(Period::parse("2020-W53").is_ok());
        assert!(Period::parse("2025-W53").is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Period::parse("garbage").is_err());
        assert!(Period::parse("2025-Q5").is_err());
        assert!(Period::parse("2025-13").is_err());
        assert!(Period::parse("2025-W00").is_err());
    }

    #[test]
    fn test_to_key() {
        assert_eq!(Period::Year(2025).to_key(), "2025");
        assert_eq!(Period::Quarter(2025, 1).to_key(), "2025-Q1");
        assert_eq!(Period::Month(2025, 1).to_key(), "2025-01");
        assert_eq!(Period::Week(2025, 5).to_key(), "2025-W05");
    }

    #[test]
    fn test_date_range_quarter() {
        let (s, e) = Period::Quarter(2025, 2).date_range();
        assert_eq!(s, d(2025, 4, 1));
        assert_eq!(e, d(2025, 6, 30));
    }

    #[test]
    fn test_date_range_month() {
        let (s, e) = Period::Month(2024, 2).date_range();
        assert_eq!(s, d(2024, 2, 1));
        assert_eq!(e, d(2024, 2, 29));
    }

    #[test]
    fn test_date_range_week() {
        let (s, e) = Period::Week(2025, 1).date_range();
        assert_eq!(s, d(2024, 12, 30));
        assert_eq!(s.weekday(), Weekday::Mon);
        assert_eq!((e - s).num_days(), 6);
    }

    #[test]
    fn test_previous() {
        assert_eq!(Period::Year(2025).previous(), Period::Year(2024));
        assert_eq!(Period::Quarter(2025, 1).previous(), Period::Quarter(2024, 4));
        assert_eq!(Period::Quarter(2025, 3).previous(), Period::Quarter(2025, 2));
        assert_eq!(Period::Month(2025, 1).previous(), Period::Month(2024, 12));
        assert_eq!(Period::Month(2025, 6).previous(), Period::Month(2025, 5));
        assert_eq!(Period::Week(2025, 10).previous(), Period::Week(2025, 9));
        assert_eq!(Period::Week(2021, 1).previous(), Period::Week(2020, 53));
        assert_eq!(Period::Week(2025, 1).previous(), Period::Week(2024, 52));
    }

    #[test]
    fn test_containing_and_key_round_trip() {
        let date = d(2025, 5, 14);
        let month = Period::containing(PeriodType::Month, date);
        assert_eq!(month, Period::Month(2025, 5));
        assert_eq!(month.period_date(), d(2025, 5, 1));
        assert_eq!(
            Period::from_type_and_date(PeriodType::Month, d(2025, 5, 1)).unwrap(),
            month
        );
        assert_eq!(
            Period::containing(PeriodType::Quarter, date),
            Period::Quarter(2025, 2)
        );
        assert!(month.contains(date));
        assert!(!month.contains(d(2025, 6, 1)));
    }

    #[test]
    fn test_from_type_and_date_rejects_mid_period() {
        assert!(Period::from_type_and_date(PeriodType::Month, d(2025, 5, 2)).is_err());
        assert!(Period::from_type_and_date(PeriodType::Week, d(2025, 5, 14)).is_err());
    }
}
