//! WWDC Core Library
//!
//! This crate provides the media download orchestration for the WWDC
//! session catalogue: transfers, persisted download metadata, and the
//! filesystem monitor that keeps downloaded flags honest. It is UI-agnostic
//! and can be driven by any frontend.

pub mod content;
pub mod db;
pub mod error;
pub mod hls;
pub mod manager;
pub mod media;
pub mod monitor;
pub mod service;
pub mod store;
pub mod transfer;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use content::{ContentDb, ContentStore};
pub use db::{
    get_db_path, init_database, open_database, Database, DownloadsDb, SessionsDb, SettingsDb,
};
pub use error::{Error, Result};
pub use manager::DownloadManager;
pub use media::{MediaAsset, MediaContainer, MediaVariant, SessionMedia, VariantPolicy};
pub use monitor::{FilesystemMonitor, MonitorEvent, MonitorHandle};
pub use service::{DownloadCommand, DownloadEvent, DownloadService};
pub use store::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
pub use transfer::{HttpTransport, Transport};
pub use types::*;
pub use utils::{calculate_progress, format_bytes, format_progress};
