//! Download metadata persistence
//!
//! The orchestrator only needs to remember what the user asked for and how
//! far each transfer got. Anything that can keep a few records across
//! restarts can back it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::{Database, DownloadsDb};
use crate::error::{Error, Result};
use crate::types::Download;

/// Persisted download metadata, keyed by content identifier
pub trait MetadataStore: Send + Sync {
    fn put(&self, download: &Download) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Download>>;

    /// Returns whether a record existed
    fn remove(&self, id: &str) -> Result<bool>;

    fn all(&self) -> Result<Vec<Download>>;
}

/// File-backed store on the application database
#[derive(Clone, Debug)]
pub struct SqliteMetadataStore {
    db: Database,
}

impl SqliteMetadataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn put(&self, download: &Download) -> Result<()> {
        DownloadsDb::save(&self.db, download)
    }

    fn get(&self, id: &str) -> Result<Option<Download>> {
        DownloadsDb::get(&self.db, id)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        DownloadsDb::delete(&self.db, id)
    }

    fn all(&self) -> Result<Vec<Download>> {
        DownloadsDb::get_all(&self.db)
    }
}

/// Cache-backed store; lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<String, Download>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Download>>> {
        self.records
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock metadata cache: {}", e)))
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put(&self, download: &Download) -> Result<()> {
        self.lock()?.insert(download.id.clone(), download.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Download>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    fn all(&self) -> Result<Vec<Download>> {
        let mut all: Vec<Download> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaVariant;
    use crate::types::DownloadState;

    fn exercise(store: &dyn MetadataStore) {
        let d = Download::new("a", "A", "https://x/a.mp4", "a.mp4", MediaVariant::SdVideo);
        store.put(&d).unwrap();
        store.put(&Download::new("b", "B", "https://x/b.mp4", "b.mp4", MediaVariant::SdVideo))
            .unwrap();

        // Writing the same id again replaces the record
        let mut paused = d.clone();
        paused.state = DownloadState::paused(0.5);
        store.put(&paused).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().state, DownloadState::paused(0.5));
        assert!(store.get("zzz").unwrap().is_none());

        assert_eq!(store.all().unwrap().len(), 2);
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryMetadataStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteMetadataStore::new(Database::in_memory().unwrap()));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wwdc.db");
        {
            let store = SqliteMetadataStore::new(crate::db::open_database(&path).unwrap());
            let d = Download::new("a", "A", "https://x/a.mp4", "a.mp4", MediaVariant::HdVideo);
            store.put(&d).unwrap();
        }
        let store = SqliteMetadataStore::new(crate::db::open_database(&path).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().variant, MediaVariant::HdVideo);
    }
}
