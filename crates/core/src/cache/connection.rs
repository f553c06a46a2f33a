//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for performance, concurrency (WAL mode) and cascading deletes, and running
//! migrations.

use super::migrations;
use crate::Error;
use std::path::Path;
use tokio_rusqlite::Connection;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

/// Cache database handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread. Cloning shares the same connection.
#[derive(Clone, Debug)]
pub struct CacheDb {
    pub(crate) conn: Connection,
}

impl CacheDb {
    /// Open a database at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations. Any failure here is reported as
    /// [`Error::StoreOpen`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let display = path.as_ref().display().to_string();
        let conn = Connection::open(path)
            .await
            .map_err(|e| Error::StoreOpen(format!("{display}: {e}")))?;

        Self::prepare(conn).await
    }

    /// Open an in-memory database for testing.
    ///
    /// Creates a temporary in-memory SQLite database with the same
    /// pragma configuration as file-based databases.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::StoreOpen(format!(":memory:: {e}")))?;

        Self::prepare(conn).await
    }

    async fn prepare(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| conn.execute_batch(PRAGMAS))
            .await
            .map_err(|e| Error::StoreOpen(e.to_string()))?;

        migrations::run(&conn).await?;

        Ok(Self { conn })
    }
}
