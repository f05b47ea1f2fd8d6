//! Database connection management

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = include_str!("../../../../migrations/001_initial.sql");

/// Get the database path
pub fn get_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("io.wwdc.app");

    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("wwdc.db")
}

/// Initialize the database at the default location
pub fn init_database() -> Result<Database> {
    open_database(get_db_path())
}

/// Open (or create) a database file and apply the schema
pub fn open_database(path: impl AsRef<Path>) -> Result<Database> {
    let path = path.as_ref();
    log::info!("Initializing database at: {:?}", path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // Run migrations
    conn.execute_batch(SCHEMA)?;

    Ok(Database {
        conn: Arc::new(Mutex::new(conn)),
    })
}

/// Database wrapper with thread-safe connection
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// In-memory database with the full schema (for tests and dry runs)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a function with the database connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock database: {}", e)))?;
        f(&conn).map_err(Into::into)
    }

    /// Execute a function with mutable database connection
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock database: {}", e)))?;
        f(&mut conn).map_err(Into::into)
    }
}
