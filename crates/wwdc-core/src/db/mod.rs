//! Database module - SQLite persistence layer

mod connection;
mod downloads;
mod sessions;
mod settings;

pub use connection::{get_db_path, init_database, open_database, Database};
pub use downloads::DownloadsDb;
pub use sessions::SessionsDb;
pub use settings::{SettingsDb, SETTING_KEYS};
