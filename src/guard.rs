//! Rules every derived computation and every write path goes through.
//!
//! Two things live here so that nothing else re-implements them:
//! the soft-delete predicate ([`SoftDeletable::is_active`] and the matching
//! SQL fragments), and the [`Write`] wrapper that stamps `updated_at` in the
//! same transaction as the change it describes.

use std::ops::Deref;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::Result;

/// SQL predicate for an active client aliased as `c`.
pub const ACTIVE_CLIENT_SQL: &str = "c.deleted_at IS NULL";

/// SQL predicate for an active quote aliased as `q`.
pub const ACTIVE_QUOTE_SQL: &str = "q.deleted_at IS NULL";

/// Anything carrying a `deleted_at` marker.
pub trait SoftDeletable {
    fn deleted_at(&self) -> Option<&DateTime<Utc>>;

    fn is_active(&self) -> bool {
        self.deleted_at().is_none()
    }
}

impl SoftDeletable for crate::model::Client {
    fn deleted_at(&self) -> Option<&DateTime<Utc>> {
        self.deleted_at.as_ref()
    }
}

impl SoftDeletable for crate::model::Quote {
    fn deleted_at(&self) -> Option<&DateTime<Utc>> {
        self.deleted_at.as_ref()
    }
}

/// Iterate over the active members of a slice.
pub fn active<T: SoftDeletable>(items: &[T]) -> impl Iterator<Item = &T> {
    items.iter().filter(|item| item.is_active())
}

/// An open write transaction plus the instant it is stamped with.
///
/// Mutating repository functions take `&Write` rather than a bare
/// connection, so they can only run inside [`write`].
pub struct Write<'conn> {
    tx: Transaction<'conn>,
    now: DateTime<Utc>,
}

impl Write<'_> {
    /// The timestamp written to every `updated_at` touched by this write.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

impl Deref for Write<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// Run `f` inside an immediate transaction. Commits on `Ok`, rolls back on
/// `Err` (the transaction is dropped uncommitted).
pub fn write<T>(conn: &mut Connection, f: impl FnOnce(&Write<'_>) -> Result<T>) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let w = Write {
        tx,
        now: Utc::now(),
    };
    let out = f(&w)?;
    w.tx.commit()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT, updated_at TEXT)")
            .unwrap();
        conn
    }

    #[test]
    fn test_write_commits_on_ok() {
        let mut conn = conn();
        write(&mut conn, |w| {
            w.execute(
                "INSERT INTO t (v, updated_at) VALUES ('a', ?1)",
                [w.now()],
            )?;
            Ok(())
        })
        .unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t WHERE updated_at IS NOT NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_write_rolls_back_on_err() {
        let mut conn = conn();
        let res: Result<()> = write(&mut conn, |w| {
            w.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            Err(Error::Other("boom".into()))
        });
        assert!(res.is_err());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
