//! Downloadable media containers and variant selection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::error::{Error, Result};

/// One of the encodings a session's media is published in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaVariant {
    SdVideo,
    HdVideo,
    HlsStream,
}

impl MediaVariant {
    /// Segmented streams are fetched playlist-first instead of as one file
    pub fn is_segmented(&self) -> bool {
        matches!(self, MediaVariant::HlsStream)
    }
}

impl std::fmt::Display for MediaVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaVariant::SdVideo => write!(f, "sd_video"),
            MediaVariant::HdVideo => write!(f, "hd_video"),
            MediaVariant::HlsStream => write!(f, "hls_stream"),
        }
    }
}

impl std::str::FromStr for MediaVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sd_video" | "sd" => Ok(MediaVariant::SdVideo),
            "hd_video" | "hd" => Ok(MediaVariant::HdVideo),
            "hls_stream" | "hls" => Ok(MediaVariant::HlsStream),
            other => Err(Error::InvalidInput(format!("unknown media variant: {}", other))),
        }
    }
}

/// Which kind of variant to download when several are available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariantPolicy {
    PreferStreaming,
    #[default]
    PreferProgressive,
}

impl std::fmt::Display for VariantPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariantPolicy::PreferStreaming => write!(f, "prefer_streaming"),
            VariantPolicy::PreferProgressive => write!(f, "prefer_progressive"),
        }
    }
}

impl From<&str> for VariantPolicy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prefer_streaming" | "streaming" => VariantPolicy::PreferStreaming,
            _ => VariantPolicy::PreferProgressive,
        }
    }
}

impl VariantPolicy {
    /// Variants in the order they should be tried
    pub fn preference_order(&self, prefer_hd: bool) -> Vec<MediaVariant> {
        let progressive = if prefer_hd {
            [MediaVariant::HdVideo, MediaVariant::SdVideo]
        } else {
            [MediaVariant::SdVideo, MediaVariant::HdVideo]
        };

        match self {
            VariantPolicy::PreferStreaming => {
                let mut order = vec![MediaVariant::HlsStream];
                order.extend(progressive);
                order
            }
            VariantPolicy::PreferProgressive => {
                let mut order = progressive.to_vec();
                order.push(MediaVariant::HlsStream);
                order
            }
        }
    }

    /// Pick the first variant the container actually offers
    pub fn select<C: MediaContainer + ?Sized>(
        &self,
        container: &C,
        prefer_hd: bool,
    ) -> Option<MediaVariant> {
        let available = container.variants();
        self.preference_order(prefer_hd)
            .into_iter()
            .find(|v| available.contains(v))
    }
}

/// Anything that can be downloaded: a stable identifier plus per-variant
/// remote URLs and local relative paths.
pub trait MediaContainer: Send + Sync {
    fn identifier(&self) -> &str;

    fn title(&self) -> &str;

    fn variants(&self) -> Vec<MediaVariant>;

    fn remote_url(&self, variant: MediaVariant) -> Option<&str>;

    fn relative_path(&self, variant: MediaVariant) -> Option<&str>;
}

/// Remote location and local path of one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub remote_url: String,
    pub relative_path: String,
}

/// A WWDC session's downloadable media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMedia {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub assets: BTreeMap<MediaVariant, MediaAsset>,
}

impl SessionMedia {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            assets: BTreeMap::new(),
        }
    }

    /// Owned copy of any container, so it can cross task boundaries
    pub fn snapshot<C: MediaContainer + ?Sized>(container: &C) -> Self {
        let mut media = Self::new(container.identifier(), container.title());
        for variant in container.variants() {
            if let (Some(url), Some(path)) =
                (container.remote_url(variant), container.relative_path(variant))
            {
                media = media.with_asset(variant, url, path);
            }
        }
        media
    }

    pub fn with_asset(
        mut self,
        variant: MediaVariant,
        remote_url: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Self {
        self.assets.insert(
            variant,
            MediaAsset {
                remote_url: remote_url.into(),
                relative_path: relative_path.into(),
            },
        );
        self
    }

    /// Reject assets whose local paths could escape the storage directory
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("session id is empty".to_string()));
        }
        for (variant, asset) in &self.assets {
            validate_relative_path(&asset.relative_path).map_err(|e| {
                Error::InvalidInput(format!("{} {}: {}", self.id, variant, e))
            })?;
        }
        Ok(())
    }
}

impl MediaContainer for SessionMedia {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn variants(&self) -> Vec<MediaVariant> {
        self.assets.keys().copied().collect()
    }

    fn remote_url(&self, variant: MediaVariant) -> Option<&str> {
        self.assets.get(&variant).map(|a| a.remote_url.as_str())
    }

    fn relative_path(&self, variant: MediaVariant) -> Option<&str> {
        self.assets.get(&variant).map(|a| a.relative_path.as_str())
    }
}

/// A relative path must stay inside the storage directory
pub fn validate_relative_path(path: &str) -> std::result::Result<(), String> {
    if path.trim().is_empty() {
        return Err("relative path is empty".to_string());
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(format!("path is absolute: {}", path));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path leaves the storage directory: {}", path)),
        }
    }
    Ok(())
}
