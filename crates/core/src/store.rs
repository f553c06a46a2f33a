//! Storage abstractions used by the caching engine.
//!
//! [`Store`] is a key/value resource store scoped to one generation and
//! [`GenerationRegistry`] creates, enumerates and deletes generations. The
//! SQLite implementations wrap [`CacheDb`]; tests can substitute their own.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;

use crate::Error;
use crate::cache::{CacheDb, CacheEntry, Generation, RequestKey, ResponseSnapshot};

/// Async key/value resource store scoped to a single generation.
#[async_trait]
pub trait Store: Send + Sync {
    /// The generation this store writes into.
    fn generation(&self) -> &Generation;

    /// Look up the entry for `key`.
    async fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>, Error>;

    /// Store `payload` under `key`, superseding any earlier entry.
    async fn put(&self, key: RequestKey, payload: ResponseSnapshot) -> Result<(), Error>;

    /// Remove the entry for `key`; returns whether one existed.
    async fn delete(&self, key: &RequestKey) -> Result<bool, Error>;

    /// Every key currently stored.
    async fn keys(&self) -> Result<Vec<RequestKey>, Error>;
}

/// Outcome of a bulk generation deletion.
///
/// Deletions are independent, so one failure never prevents the others from
/// being attempted.
#[derive(Debug, Default)]
pub struct DeletionReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl DeletionReport {
    /// True when every attempted deletion succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Enumerates, creates and deletes named generations.
#[async_trait]
pub trait GenerationRegistry: Send + Sync {
    type Store: Store + 'static;

    /// Return the store for `id`, creating the generation if absent.
    async fn open(&self, id: &str) -> Result<Self::Store, Error>;

    /// All known generation ids, in no particular order.
    async fn list(&self) -> Result<Vec<String>, Error>;

    /// Delete one generation and every entry inside it.
    async fn delete(&self, id: &str) -> Result<bool, Error>;

    /// Delete every generation whose id is not exactly `active_id`.
    ///
    /// Deletions run concurrently and settle independently.
    async fn delete_except(&self, active_id: &str) -> Result<DeletionReport, Error> {
        let stale: Vec<String> = self.list().await?.into_iter().filter(|id| id != active_id).collect();
        Ok(self.delete_settled(stale).await)
    }

    /// Delete every generation, the active one included.
    async fn delete_all(&self) -> Result<DeletionReport, Error> {
        let ids = self.list().await?;
        Ok(self.delete_settled(ids).await)
    }

    /// Fan out deletions and wait for all of them, successes and failures alike.
    async fn delete_settled(&self, ids: Vec<String>) -> DeletionReport {
        let results = join_all(ids.into_iter().map(|id| async move {
            let result = self.delete(&id).await;
            (id, result)
        }))
        .await;

        let mut report = DeletionReport::default();
        for (id, result) in results {
            match result {
                Ok(_) => {
                    tracing::info!(generation = %id, "deleted generation");
                    report.deleted.push(id);
                }
                Err(e) => {
                    tracing::warn!(generation = %id, error = %e, "failed to delete generation");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }
}

/// [`Store`] backed by the SQLite cache database.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: CacheDb,
    generation: Generation,
}

#[async_trait]
impl Store for SqliteStore {
    fn generation(&self) -> &Generation {
        &self.generation
    }

    async fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>, Error> {
        self.db.get_entry(&self.generation.id, key).await
    }

    async fn put(&self, key: RequestKey, payload: ResponseSnapshot) -> Result<(), Error> {
        let entry = CacheEntry { key, payload, stored_at: Utc::now() };
        self.db.upsert_entry(&self.generation.id, &entry).await
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, Error> {
        self.db.delete_entry(&self.generation.id, key).await
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, Error> {
        self.db.list_entry_keys(&self.generation.id).await
    }
}

/// [`GenerationRegistry`] backed by the SQLite cache database.
#[derive(Clone, Debug)]
pub struct SqliteRegistry {
    db: CacheDb,
}

impl SqliteRegistry {
    pub fn new(db: CacheDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GenerationRegistry for SqliteRegistry {
    type Store = SqliteStore;

    async fn open(&self, id: &str) -> Result<SqliteStore, Error> {
        let generation = self
            .db
            .ensure_generation(id)
            .await
            .map_err(|e| Error::StoreOpen(format!("{id}: {e}")))?;
        Ok(SqliteStore { db: self.db.clone(), generation })
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self.db.list_generations().await?.into_iter().map(|g| g.id).collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, Error> {
        self.db.delete_generation(id).await
    }
}
