//! Generation bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;

use super::connection::CacheDb;
use crate::Error;

/// A named namespace of cached entries representing one deployment version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl CacheDb {
    /// Create the generation if it doesn't exist and return it.
    ///
    /// Idempotent: an existing generation keeps its original `created_at`.
    pub async fn ensure_generation(&self, id: &str) -> Result<Generation, Error> {
        if id.is_empty() {
            return Err(Error::InvalidInput("generation id cannot be empty".into()));
        }

        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<Generation, Error> {
                conn.execute(
                    "INSERT OR IGNORE INTO generations (id, created_at) VALUES (?1, ?2)",
                    params![&id, now],
                )?;
                let created_at: String =
                    conn.query_row("SELECT created_at FROM generations WHERE id = ?1", params![&id], |row| {
                        row.get(0)
                    })?;
                Ok(Generation { created_at: parse_timestamp(&id, &created_at)?, id })
            })
            .await
            .map_err(Error::from)
    }

    /// All known generations, oldest first.
    pub async fn list_generations(&self) -> Result<Vec<Generation>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<Generation>, Error> {
                let mut stmt = conn.prepare("SELECT id, created_at FROM generations ORDER BY created_at ASC, id ASC")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(id, created_at)| Ok(Generation { created_at: parse_timestamp(&id, &created_at)?, id }))
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a generation and, by cascade, every entry inside it.
    ///
    /// Returns whether the generation existed.
    pub async fn delete_generation(&self, id: &str) -> Result<bool, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute("DELETE FROM generations WHERE id = ?1", params![id])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CorruptEntry(format!("generation {id}: created_at: {e}")))
}
