//! Content data layer seam
//!
//! Session records belong to the catalogue. The download agent only reads
//! which local paths belong to which session and flips the downloaded flag.

use std::collections::BTreeMap;

use crate::db::{Database, SessionsDb};
use crate::error::Result;
use crate::media::SessionMedia;

pub trait ContentStore: Send + Sync {
    /// Content identifier -> relative paths of all its variants
    fn media_paths(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// Apply a batch of downloaded flag changes
    fn set_downloaded(&self, updates: &[(String, bool)]) -> Result<()>;

    fn is_downloaded(&self, id: &str) -> Result<bool>;
}

/// Catalogue kept in the application database
#[derive(Clone, Debug)]
pub struct ContentDb {
    db: Database,
}

impl ContentDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert_session(&self, session: &SessionMedia) -> Result<()> {
        session.validate()?;
        SessionsDb::upsert(&self.db, session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionMedia>> {
        SessionsDb::get(&self.db, id)
    }

    pub fn list_sessions(&self) -> Result<Vec<(String, String, bool)>> {
        SessionsDb::list(&self.db)
    }
}

impl ContentStore for ContentDb {
    fn media_paths(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut paths: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, path) in SessionsDb::asset_paths(&self.db)? {
            paths.entry(id).or_default().push(path);
        }
        Ok(paths)
    }

    fn set_downloaded(&self, updates: &[(String, bool)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let changed = SessionsDb::set_downloaded(&self.db, updates)?;
        log::debug!("Updated downloaded flag on {} sessions", changed);
        Ok(())
    }

    fn is_downloaded(&self, id: &str) -> Result<bool> {
        Ok(SessionsDb::is_downloaded(&self.db, id)?.unwrap_or(false))
    }
}
