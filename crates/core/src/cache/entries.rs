//! Cache entry CRUD operations.
//!
//! Entries live inside a generation. Writes are whole-entry upserts, so the
//! last completed write for a key wins and no partially written entry is ever
//! observable.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::key::RequestKey;
use crate::Error;

/// How a response body was obtained, mirroring the fetch response types.
///
/// `FetchClient` only ever yields `Basic` or `Cors`. `Opaque` and `Error`
/// are part of the stored format so any other `Network` implementation
/// can label no-cors and failed responses. The strategies never store either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Same-origin response with a fully readable body.
    Basic,
    /// Cross-origin response obtained in CORS mode.
    Cors,
    /// Cross-origin response whose body cannot be inspected.
    Opaque,
    /// Network error placeholder.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// Immutable, byte-exact capture of a response at store time.
///
/// The body is reference-counted: cloning a snapshot yields an independent
/// readable copy without copying the bytes. Header values are kept as raw
/// bytes since they need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub response_type: ResponseType,
}

impl ResponseSnapshot {
    /// First raw header value with the given (case-insensitive) name.
    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Like [`header_bytes`](Self::header_bytes), for values that are valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_bytes(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// A stored response together with its key and storage time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub payload: ResponseSnapshot,
    pub stored_at: DateTime<Utc>,
}

impl CacheDb {
    /// Insert or replace the entry for `entry.key` in `generation_id`.
    ///
    /// The generation row is created if missing so a store that outlived a
    /// clear keeps working.
    pub async fn upsert_entry(&self, generation_id: &str, entry: &CacheEntry) -> Result<(), Error> {
        let generation_id = generation_id.to_string();
        let entry = entry.clone();
        let headers_json = serde_json::to_string(&entry.payload.headers)
            .map_err(|e| Error::InvalidInput(format!("unserializable headers: {e}")))?;

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO generations (id, created_at) VALUES (?1, ?2)",
                    params![&generation_id, entry.stored_at.to_rfc3339()],
                )?;
                tx.execute(
                    "INSERT INTO entries (
                        generation_id, key_hash, method, url, status, status_text,
                        headers_json, body, response_type, stored_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(generation_id, key_hash) DO UPDATE SET
                        method = excluded.method,
                        url = excluded.url,
                        status = excluded.status,
                        status_text = excluded.status_text,
                        headers_json = excluded.headers_json,
                        body = excluded.body,
                        response_type = excluded.response_type,
                        stored_at = excluded.stored_at",
                    params![
                        &generation_id,
                        entry.key.hash(),
                        entry.key.method(),
                        entry.key.url(),
                        entry.payload.status,
                        &entry.payload.status_text,
                        headers_json,
                        entry.payload.body.as_ref(),
                        entry.payload.response_type.as_str(),
                        entry.stored_at.to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get the entry for `key` in `generation_id`.
    ///
    /// Returns None if the generation or the entry doesn't exist.
    pub async fn get_entry(&self, generation_id: &str, key: &RequestKey) -> Result<Option<CacheEntry>, Error> {
        let generation_id = generation_id.to_string();
        let hash = key.hash();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT method, url, status, status_text, headers_json, body, response_type, stored_at
                     FROM entries WHERE generation_id = ?1 AND key_hash = ?2",
                )?;

                let result = stmt.query_row(params![generation_id, hash], |row| {
                    Ok(StoredRow {
                        method: row.get(0)?,
                        url: row.get(1)?,
                        status: row.get(2)?,
                        status_text: row.get(3)?,
                        headers_json: row.get(4)?,
                        body: row.get(5)?,
                        response_type: row.get(6)?,
                        stored_at: row.get(7)?,
                    })
                });

                match result {
                    Ok(row) => row.into_entry().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete the entry for `key` in `generation_id`.
    ///
    /// Returns whether an entry was removed.
    pub async fn delete_entry(&self, generation_id: &str, key: &RequestKey) -> Result<bool, Error> {
        let generation_id = generation_id.to_string();
        let hash = key.hash();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE generation_id = ?1 AND key_hash = ?2",
                    params![generation_id, hash],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// All keys stored in `generation_id`, ordered by URL.
    pub async fn list_entry_keys(&self, generation_id: &str) -> Result<Vec<RequestKey>, Error> {
        let generation_id = generation_id.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<RequestKey>, Error> {
                let mut stmt =
                    conn.prepare("SELECT method, url FROM entries WHERE generation_id = ?1 ORDER BY url ASC")?;
                let keys = stmt
                    .query_map(params![generation_id], |row| {
                        Ok(RequestKey::from_stored(row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }
}

struct StoredRow {
    method: String,
    url: String,
    status: u16,
    status_text: String,
    headers_json: String,
    body: Vec<u8>,
    response_type: String,
    stored_at: String,
}

impl StoredRow {
    fn into_entry(self) -> Result<CacheEntry, Error> {
        let headers: Vec<(String, Vec<u8>)> = serde_json::from_str(&self.headers_json)
            .map_err(|e| Error::CorruptEntry(format!("{}: headers: {e}", self.url)))?;
        let response_type = ResponseType::parse(&self.response_type)
            .ok_or_else(|| Error::CorruptEntry(format!("{}: response type {}", self.url, self.response_type)))?;
        let stored_at = DateTime::parse_from_rfc3339(&self.stored_at)
            .map_err(|e| Error::CorruptEntry(format!("{}: stored_at: {e}", self.url)))?
            .with_timezone(&Utc);

        Ok(CacheEntry {
            key: RequestKey::from_stored(self.method, self.url),
            payload: ResponseSnapshot {
                status: self.status,
                status_text: self.status_text,
                headers,
                body: Bytes::from(self.body),
                response_type,
            },
            stored_at,
        })
    }
}
