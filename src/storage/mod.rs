pub mod repository;

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};
use crate::guard::{self, Write};

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode for concurrent access. The writer serializes writes via
/// `tokio_rusqlite`'s internal channel; the reader only ever sees committed
/// transactions.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open the database at the default path (`~/.estimatedw/estimatedw.db`).
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".estimatedw");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("estimatedw.db")).await
    }

    /// Open the database at the given path.
    pub async fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_reader(&reader).await?;

        Ok(Self { writer, reader })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // For in-memory, we share the same connection for reader/writer
        // since in-memory DBs are per-connection.
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            let migrations = Migrations::new(vec![
                M::up(include_str!("migrations/001_initial.sql")),
                M::up(include_str!("migrations/002_refresh_lease.sql")),
            ]);
            migrations
                .to_latest(conn)
                .map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    /// Get a reference to the writer connection.
    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    /// Get a reference to the reader connection.
    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }

    /// Run `f` as one write transaction on the writer connection.
    /// See [`guard::write`].
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Write<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.writer
            .call(move |conn| Ok::<_, rusqlite::Error>(guard::write(conn, f)))
            .await?
    }

    /// Run `f` against a single read transaction on the reader connection,
    /// so every query inside `f` sees the same committed state.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.reader
            .call(move |conn| Ok::<_, rusqlite::Error>(read_consistent(conn, f)))
            .await?
    }
}

fn read_consistent<T>(
    conn: &mut rusqlite::Connection,
    f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let out = f(&tx)?;
    // Nothing was written; finishing the transaction just releases the snapshot.
    tx.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        for table in [
            "clients",
            "quotes",
            "work_areas",
            "line_items",
            "payments",
            "refresh_state",
            "snapshot_global_kpis",
            "snapshot_client_segments",
            "snapshot_top_categories",
            "work_type_stats",
            "region_stats",
            "app_config",
            "refresh_lease",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_open_at_file_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).await.unwrap();
        db.write(|w| {
            repository::set_config(w, "k", "v")?;
            Ok(())
        })
        .await
        .unwrap();
        drop(db);

        // Migrations are idempotent on reopen and data survives.
        let db = Database::open_at(&path).await.unwrap();
        let v = db
            .read(|conn| Ok(repository::get_config(conn, "k")?))
            .await
            .unwrap();
        assert_eq!(v, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_write_error_is_not_flattened() {
        let db = Database::open_memory().await.unwrap();
        let err = db
            .write(|_w| -> Result<()> { Err(Error::NotFound("client 9".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
