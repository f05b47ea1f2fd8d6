//! Minimal HLS playlist parsing for segmented-stream downloads
//!
//! Only what a downloader needs: master playlists yield their variant
//! streams, media playlists yield their segment URIs with the fMP4
//! initialization section first. Playlists whose segments cannot simply be
//! concatenated into one playable file are rejected: encryption, byte-range
//! segments, and audio carried in a separate rendition.

use reqwest::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub uri: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playlist {
    Master(Vec<VariantStream>),
    Media(Vec<Url>),
}

fn unsupported(what: &str) -> Error {
    Error::InvalidInput(format!("{} are not supported", what))
}

/// Parse a playlist, resolving relative URIs against `base`
pub fn parse_playlist(text: &str, base: &Url) -> Result<Playlist> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(Error::InvalidInput("not an M3U8 playlist".to_string()));
    }

    let resolve = |uri: &str| {
        base.join(uri)
            .map_err(|e| Error::InvalidInput(format!("bad playlist URI {}: {}", uri, e)))
    };

    let mut variants = Vec::new();
    let mut segments = Vec::new();
    let mut init: Option<Url> = None;
    let mut pending_bandwidth: Option<u64> = None;
    let mut pending_segment = false;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = attribute(attrs, "BANDWIDTH").and_then(|b| b.parse().ok());
            pending_bandwidth = Some(bandwidth.unwrap_or(0));
        } else if line.starts_with("#EXTINF:") {
            pending_segment = true;
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            if attribute(attrs, "METHOD").is_some_and(|m| m != "NONE") {
                return Err(unsupported("encrypted streams"));
            }
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-MAP:") {
            if attribute(attrs, "BYTERANGE").is_some() {
                return Err(unsupported("byte-range initialization sections"));
            }
            let uri = attribute(attrs, "URI")
                .ok_or_else(|| Error::InvalidInput("EXT-X-MAP without URI".to_string()))?;
            let uri = resolve(uri.as_str())?;
            match &init {
                None => init = Some(uri),
                Some(existing) if *existing == uri => {}
                Some(_) => return Err(unsupported("changing initialization sections")),
            }
        } else if line.starts_with("#EXT-X-BYTERANGE:") {
            return Err(unsupported("byte-range segments"));
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-MEDIA:") {
            // Renditions without a URI are muxed into the variant streams
            if attribute(attrs, "TYPE").as_deref() == Some("AUDIO")
                && attribute(attrs, "URI").is_some()
            {
                return Err(unsupported("separate audio renditions"));
            }
        } else if line.starts_with('#') {
            continue;
        } else {
            let uri = resolve(line)?;
            if let Some(bandwidth) = pending_bandwidth.take() {
                variants.push(VariantStream { bandwidth, uri });
            } else if pending_segment {
                segments.push(uri);
                pending_segment = false;
            }
        }
    }

    if !variants.is_empty() {
        Ok(Playlist::Master(variants))
    } else {
        Ok(Playlist::Media(init.into_iter().chain(segments).collect()))
    }
}

/// Highest-bandwidth variant of a master playlist
pub fn best_variant(variants: &[VariantStream]) -> Option<&VariantStream> {
    variants.iter().max_by_key(|v| v.bandwidth)
}

// Attribute lists are comma separated KEY=VALUE pairs; values may be quoted
// and quoted values may contain commas.
fn attribute(attrs: &str, key: &str) -> Option<String> {
    let mut rest = attrs;
    while !rest.is_empty() {
        let (name, after_eq) = rest.split_once('=')?;
        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            let end = quoted.find('"')?;
            let remainder = quoted[end + 1..].trim_start_matches(',');
            (&quoted[..end], remainder)
        } else {
            match after_eq.split_once(',') {
                Some((v, r)) => (v, r),
                None => (after_eq, ""),
            }
        };
        if name.trim() == key {
            return Some(value.to_string());
        }
        rest = remainder;
    }
    None
}
