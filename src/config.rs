//! Engine settings, persisted in the `app_config` table.

use std::str::FromStr;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::repository;

pub const REFRESH_TIMEOUT_SECS: &str = "refresh_timeout_secs";
pub const REFRESH_INTERVAL_SECS: &str = "refresh_interval_secs";
pub const TREND_STABLE_BAND_PCT: &str = "trend_stable_band_pct";
pub const TOP_CATEGORIES_LIMIT: &str = "top_categories_limit";

/// Keys the engine reads, with their defaults.
pub const KNOWN_KEYS: &[(&str, &str)] = &[
    (REFRESH_TIMEOUT_SECS, "30"),
    (REFRESH_INTERVAL_SECS, "300"),
    (TREND_STABLE_BAND_PCT, "1.0"),
    (TOP_CATEGORIES_LIMIT, "10"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    /// A refresh still reading after this long is abandoned.
    pub refresh_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    /// Half-width of the STABLE trend band, in percent.
    pub trend_stable_band_pct: f64,
    pub top_categories_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_timeout_secs: 30,
            refresh_interval_secs: 300,
            trend_stable_band_pct: 1.0,
            top_categories_limit: 10,
        }
    }
}

impl EngineConfig {
    /// Read every known key, falling back to defaults for unset ones.
    pub fn load(conn: &Connection) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            refresh_timeout_secs: read(conn, REFRESH_TIMEOUT_SECS)?
                .unwrap_or(defaults.refresh_timeout_secs),
            refresh_interval_secs: read(conn, REFRESH_INTERVAL_SECS)?
                .unwrap_or(defaults.refresh_interval_secs),
            trend_stable_band_pct: read(conn, TREND_STABLE_BAND_PCT)?
                .unwrap_or(defaults.trend_stable_band_pct),
            top_categories_limit: read(conn, TOP_CATEGORIES_LIMIT)?
                .unwrap_or(defaults.top_categories_limit),
        })
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Check a value before it is stored. Unknown keys are accepted as-is.
pub fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        REFRESH_TIMEOUT_SECS | REFRESH_INTERVAL_SECS => {
            let secs: u64 = parse(key, value)?;
            if secs == 0 {
                return Err(Error::Config(format!("{key} must be at least 1")));
            }
        }
        TREND_STABLE_BAND_PCT => {
            let band: f64 = parse(key, value)?;
            if !band.is_finite() || band < 0.0 {
                return Err(Error::Config(format!("{key} must be a non-negative number")));
            }
        }
        TOP_CATEGORIES_LIMIT => {
            parse::<usize>(key, value)?;
        }
        _ => {}
    }
    Ok(())
}

fn read<T: FromStr>(conn: &Connection, key: &str) -> Result<Option<T>> {
    match repository::get_config(conn, key)? {
        Some(value) => {
            validate(key, &value)?;
            parse(key, &value).map(Some)
        }
        None => Ok(None),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let db = Database::open_memory().await.unwrap();
        let cfg = db.read(|conn| EngineConfig::load(conn)).await.unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.refresh_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_overrides_are_read() {
        let db = Database::open_memory().await.unwrap();
        db.write(|w| {
            repository::set_config(w, TREND_STABLE_BAND_PCT, "2.5")?;
            repository::set_config(w, REFRESH_TIMEOUT_SECS, " 5 ")?;
            Ok(())
        })
        .await
        .unwrap();
        let cfg = db.read(|conn| EngineConfig::load(conn)).await.unwrap();
        assert_eq!(cfg.trend_stable_band_pct, 2.5);
        assert_eq!(cfg.refresh_timeout_secs, 5);
        assert_eq!(cfg.top_categories_limit, 10);
    }

    #[tokio::test]
    async fn test_bad_value_names_the_key() {
        let db = Database::open_memory().await.unwrap();
        db.write(|w| {
            repository::set_config(w, REFRESH_INTERVAL_SECS, "often")?;
            Ok(())
        })
        .await
        .unwrap();
        let err = db.read(|conn| EngineConfig::load(conn)).await.unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains(REFRESH_INTERVAL_SECS), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate() {
        assert!(validate(REFRESH_TIMEOUT_SECS, "0").is_err());
        assert!(validate(REFRESH_TIMEOUT_SECS, "10").is_ok());
        assert!(validate(TREND_STABLE_BAND_PCT, "-1").is_err());
        assert!(validate(TREND_STABLE_BAND_PCT, "0").is_ok());
        assert!(validate(TOP_CATEGORIES_LIMIT, "ten").is_err());
        assert!(validate("unrelated_key", "anything").is_ok());
    }
}
