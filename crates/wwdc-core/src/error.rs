//! Error handling for the WWDC download agent

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("a download for {0} is already in progress")]
    AlreadyDownloading(String),

    #[error("no downloadable variant for {0}")]
    NoDownloadableVariant(String),

    #[error("invalid state for {id}: {message}")]
    InvalidState { id: String, message: String },

    #[error("download service is not running")]
    ServiceStopped,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ServiceStopped
    }
}

pub type Result<T> = std::result::Result<T, Error>;
