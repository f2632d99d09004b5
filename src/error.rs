use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid period format: {0}")]
    PeriodParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("A refresh is already in progress")]
    RefreshInProgress,

    #[error("Refresh abandoned after {0}s; previous snapshot remains current")]
    RefreshTimeout(u64),

    #[error("Refresh cancelled")]
    RefreshCancelled,

    #[error("Refresh superseded by another refresh; results discarded")]
    RefreshSuperseded,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller (or the scheduler) may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RefreshInProgress | Error::RefreshTimeout(_) | Error::RefreshSuperseded
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            Error::ConstraintViolation(e.to_string())
        } else {
            Error::Database(e.to_string())
        }
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.to_string())
    }
}

/// Defaults to the crate error; repository readers name `rusqlite::Error` explicitly.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_failure_maps_to_constraint_violation() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: Error = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::ConstraintViolation(_)), "got {err:?}");
    }

    #[test]
    fn test_other_sqlite_failure_maps_to_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: Error = conn
            .execute("INSERT INTO missing VALUES (1)", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Database(_)), "got {err:?}");
    }

    #[test]
    fn test_result_alias_takes_an_explicit_error_type() {
        fn count(conn: &rusqlite::Connection) -> Result<i64, rusqlite::Error> {
            conn.query_row("SELECT 2", [], |row| row.get(0))
        }
        fn doubled(conn: &rusqlite::Connection) -> Result<i64> {
            Ok(count(conn)? * 2)
        }
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        assert_eq!(doubled(&conn).unwrap(), 4);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::RefreshInProgress.is_retryable());
        assert!(Error::RefreshTimeout(30).is_retryable());
        assert!(Error::RefreshSuperseded.is_retryable());
        assert!(!Error::NotFound("client 1".into()).is_retryable());
    }
}
