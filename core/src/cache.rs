//! Durable on-device copy of every entity type.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::db::{Database, ProgressQuery};
use crate::models::{Entity, ProgressRecord, TrackedItem};

/// Synchronous per-entity store. Writes to one store never interleave.
pub trait LocalCache<E: Entity>: Send + Sync {
    fn fetch_all(&self) -> Result<Vec<E>>;

    /// Upsert by primary id.
    fn save(&self, entity: &E) -> Result<()>;

    fn delete(&self, entity: &E) -> Result<()>;
}

/// [`LocalCache`] over the shared SQLite database.
#[derive(Clone)]
pub struct SqliteCache {
    db: Arc<Mutex<Database>>,
}

impl SqliteCache {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalCache<TrackedItem> for SqliteCache {
    fn fetch_all(&self) -> Result<Vec<TrackedItem>> {
        self.db().list_items(None)
    }

    fn save(&self, item: &TrackedItem) -> Result<()> {
        self.db().upsert_item(item)
    }

    fn delete(&self, item: &TrackedItem) -> Result<()> {
        self.db().delete_item(item.id)?;
        Ok(())
    }
}

impl LocalCache<ProgressRecord> for SqliteCache {
    fn fetch_all(&self) -> Result<Vec<ProgressRecord>> {
        self.db().list_progress(&ProgressQuery::default())
    }

    fn save(&self, record: &ProgressRecord) -> Result<()> {
        self.db().upsert_progress(record)
    }

    fn delete(&self, record: &ProgressRecord) -> Result<()> {
        self.db().delete_progress(record.id)?;
        Ok(())
    }
}
