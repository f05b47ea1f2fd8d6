//! Types module - data structures for the download agent
//!
//! These types define the data models used throughout the application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::media::{MediaVariant, VariantPolicy};

/// Download model
///
/// One entry per content item. `relative_path` is relative to the
/// configured storage directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub title: String,
    pub remote_url: String,
    pub relative_path: String,
    pub variant: MediaVariant,
    pub state: DownloadState,
    pub created_at: String,
    pub updated_at: String,
    pub error_message: Option<String>,
}

impl Download {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        remote_url: impl Into<String>,
        relative_path: impl Into<String>,
        variant: MediaVariant,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            title: title.into(),
            remote_url: remote_url.into(),
            relative_path: relative_path.into(),
            variant,
            state: DownloadState::Waiting,
            created_at: now.clone(),
            updated_at: now,
            error_message: None,
        }
    }

    /// Whether this download still occupies its identifier's transfer slot.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }
}

/// Download state
///
/// `Waiting -> Downloading <-> Paused -> Completed | Failed | Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DownloadState {
    #[default]
    Waiting,
    Downloading {
        progress: f64,
    },
    Paused {
        progress: f64,
    },
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn downloading(progress: f64) -> Self {
        DownloadState::Downloading {
            progress: clamp_progress(progress),
        }
    }

    pub fn paused(progress: f64) -> Self {
        DownloadState::Paused {
            progress: clamp_progress(progress),
        }
    }

    /// Waiting, downloading and paused downloads hold the transfer slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Waiting
                | DownloadState::Downloading { .. }
                | DownloadState::Paused { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn progress(&self) -> f64 {
        match self {
            DownloadState::Downloading { progress } | DownloadState::Paused { progress } => {
                *progress
            }
            DownloadState::Completed => 1.0,
            _ => 0.0,
        }
    }

    /// Status column value used by the metadata store
    pub fn status_str(&self) -> &'static str {
        match self {
            DownloadState::Waiting => "waiting",
            DownloadState::Downloading { .. } => "downloading",
            DownloadState::Paused { .. } => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }

    /// Rebuild a state from its persisted status and progress columns
    pub fn from_parts(status: &str, progress: f64) -> Self {
        match status.to_lowercase().as_str() {
            "downloading" => DownloadState::downloading(progress),
            "paused" => DownloadState::paused(progress),
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" => DownloadState::Cancelled,
            _ => DownloadState::Waiting,
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadState::Downloading { progress } => {
                write!(f, "downloading ({:.0}%)", progress * 100.0)
            }
            DownloadState::Paused { progress } => write!(f, "paused ({:.0}%)", progress * 100.0),
            other => write!(f, "{}", other.status_str()),
        }
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub storage_path: String,
    pub variant_policy: VariantPolicy,
    pub prefer_hd: bool,
    pub resume_on_launch: bool,
    pub monitor_poll_interval_ms: u64,
    pub monitor_debounce_ms: u64,
    pub user_agent: String,
}

impl Settings {
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }
}

impl Default for Settings {
    fn default() -> Self {
        let storage_path = dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
            .join("io.wwdc.app")
            .join("Downloads")
            .to_string_lossy()
            .to_string();

        Self {
            storage_path,
            variant_policy: VariantPolicy::PreferProgressive,
            prefer_hd: true,
            resume_on_launch: false,
            monitor_poll_interval_ms: 1000,
            monitor_debounce_ms: 500,
            user_agent: concat!("wwdc-agent/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
