//! Database schema migrations.
//!
//! A `_migrations` table records every applied version. Pending migrations are
//! applied inside one transaction so a crash mid-upgrade leaves the previous
//! schema intact.

use super::Error;
use tokio_rusqlite::{Connection, params};

/// A single schema step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version. Every script uses CREATE ... IF NOT EXISTS.
const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "generations", sql: include_str!("../../migrations/001_generations.sql") },
    Migration { version: 2, name: "entries", sql: include_str!("../../migrations/002_entries.sql") },
];

/// Run any pending migrations.
///
/// # Errors
///
/// Returns [`Error::MigrationFailed`] naming the step whose SQL failed.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| -> Result<(), Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current: i64 =
            conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?;

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let tx = conn.transaction()?;
        for migration in pending {
            tx.execute_batch(migration.sql)
                .map_err(|e| Error::MigrationFailed(format!("{} ({}): {e}", migration.version, migration.name)))?;
            tx.execute(
                "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, chrono::Utc::now().to_rfc3339()],
            )?;
            tracing::debug!(version = migration.version, name = migration.name, "applied migration");
        }
        tx.commit()?;

        Ok(())
    })
    .await
    .map_err(Error::from)
}
