// HLS Playlist: fetches a media playlist and turns it into an ordered segment list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::{KeyMethod, MediaPlaylist, parse_playlist_res};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::error::JobError;
use crate::headers::HeaderProfile;

/// An `EXT-X-KEY` with `METHOD=AES-128`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    pub uri: Url,
    /// Explicit IV from the tag; when absent the IV is derived per segment.
    pub iv: Option<[u8; 16]>,
}

/// Absolute byte window of a sub-range segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    /// Exclusive end offset, `None` when `start + length` overflows.
    pub fn end(&self) -> Option<u64> {
        self.start.checked_add(self.length)
    }

    /// Value for the HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.start,
            self.start.saturating_add(self.length.saturating_sub(1))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position in the playlist, contiguous from zero. This is the reassembly order.
    pub index: usize,
    /// `EXT-X-MEDIA-SEQUENCE` + index.
    pub media_sequence: u64,
    pub uri: Url,
    pub duration: f32,
    pub byte_range: Option<ByteRange>,
    /// Index into [`Playlist::keys`] of the key in force for this segment.
    pub key: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub url: Url,
    pub segments: Vec<Segment>,
    /// Distinct keys in order of first appearance.
    pub keys: Vec<KeyRef>,
}

impl Playlist {
    pub fn is_encrypted(&self) -> bool {
        !self.keys.is_empty()
    }

    /// The first key of the playlist, if any segment is encrypted.
    pub fn encryption_key(&self) -> Option<&KeyRef> {
        self.keys.first()
    }

    pub fn key_for(&self, segment: &Segment) -> Option<&KeyRef> {
        segment.key.and_then(|k| self.keys.get(k))
    }
}

/// Resolve a URI from the playlist against the playlist's own URL.
///
/// Handles absolute (`https://..`), scheme-relative (`//host/..`), root-relative
/// (`/path`) and relative (`seg.ts`, `../seg.ts`) forms.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<Url, url::ParseError> {
    base.join(uri.trim())
}

fn parse_iv(iv_hex_str: &str) -> Result<[u8; 16], String> {
    let iv_str = iv_hex_str
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv_bytes = [0u8; 16];
    hex::decode_to_slice(iv_str, &mut iv_bytes)
        .map_err(|e| format!("Failed to parse IV '{iv_hex_str}': {e}"))?;
    Ok(iv_bytes)
}

/// Parse manifest bytes fetched from `url`.
///
/// Either every segment resolves and the result is complete, or an error is
/// returned; a partially valid playlist is never produced.
pub fn parse_playlist(url: &Url, bytes: &[u8]) -> Result<Playlist, JobError> {
    let media = match parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => pl,
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => {
            return Err(JobError::manifest_parse(
                url.as_str(),
                format!(
                    "master playlist with {} variants; a media playlist URL is required",
                    pl.variants.len()
                ),
            ));
        }
        Err(e) => return Err(JobError::manifest_parse(url.as_str(), e)),
    };
    build_playlist(url, media)
}

fn build_playlist(url: &Url, media: MediaPlaylist) -> Result<Playlist, JobError> {
    if media.segments.is_empty() {
        return Err(JobError::manifest_parse(url.as_str(), "no segments found"));
    }

    let mut keys: Vec<KeyRef> = Vec::new();
    let mut key_slots: HashMap<(Url, Option<[u8; 16]>), usize> = HashMap::new();
    let mut current_key: Option<usize> = None;
    // (uri, end offset) of the previous sub-range segment
    let mut last_range_end: Option<(Url, u64)> = None;
    let mut segments = Vec::with_capacity(media.segments.len());

    for (index, raw) in media.segments.into_iter().enumerate() {
        // m3u8-rs attaches a key tag only to the segment that follows it,
        // the key stays in force until the next tag.
        if let Some(key) = &raw.key {
            current_key = match &key.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let uri = key.uri.as_deref().ok_or_else(|| {
                        JobError::manifest_parse(url.as_str(), "AES-128 key tag without URI")
                    })?;
                    let uri = resolve_uri(url, uri).map_err(|e| {
                        JobError::manifest_parse(url.as_str(), format!("key URI `{uri}`: {e}"))
                    })?;
                    let iv = key
                        .iv
                        .as_deref()
                        .map(parse_iv)
                        .transpose()
                        .map_err(|e| JobError::manifest_parse(url.as_str(), e))?;
                    let slot = *key_slots.entry((uri.clone(), iv)).or_insert_with(|| {
                        keys.push(KeyRef { uri, iv });
                        keys.len() - 1
                    });
                    Some(slot)
                }
                other => {
                    return Err(JobError::manifest_parse(
                        url.as_str(),
                        format!("unsupported encryption method {other:?}"),
                    ));
                }
            };
        }

        let uri = resolve_uri(url, &raw.uri).map_err(|e| {
            JobError::manifest_parse(url.as_str(), format!("segment URI `{}`: {e}", raw.uri))
        })?;

        let byte_range = match raw.byte_range.as_ref() {
            Some(range) => {
                let start = range.offset.unwrap_or_else(|| match &last_range_end {
                    Some((prev_uri, end)) if *prev_uri == uri => *end,
                    _ => 0,
                });
                let byte_range = ByteRange {
                    start,
                    length: range.length,
                };
                let end = byte_range.end().filter(|_| range.length > 0).ok_or_else(|| {
                    JobError::manifest_parse(
                        url.as_str(),
                        format!(
                            "invalid byte range {}@{start} on segment {index}",
                            range.length
                        ),
                    )
                })?;
                last_range_end = Some((uri.clone(), end));
                Some(byte_range)
            }
            None => {
                last_range_end = None;
                None
            }
        };

        segments.push(Segment {
            index,
            media_sequence: media.media_sequence + index as u64,
            uri,
            duration: raw.duration,
            byte_range,
            key: current_key,
        });
    }

    debug!(
        url = %url,
        segments = segments.len(),
        keys = keys.len(),
        "Parsed media playlist"
    );

    Ok(Playlist {
        url: url.clone(),
        segments,
        keys,
    })
}

/// Fetches the manifest of a job with the job's header profile.
pub struct PlaylistLoader {
    client: Client,
    profile: Arc<HeaderProfile>,
    timeout: Duration,
}

impl PlaylistLoader {
    pub fn new(client: Client, profile: Arc<HeaderProfile>, timeout: Duration) -> Self {
        Self {
            client,
            profile,
            timeout,
        }
    }

    /// GET and parse the manifest. No retry: a missing manifest fails the job.
    pub async fn load(&self, url: &Url) -> Result<Playlist, JobError> {
        info!(url = %url, "Downloading playlist");

        let response = self
            .profile
            .apply(self.client.get(url.clone()))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| JobError::manifest_fetch(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::manifest_fetch(
                url.as_str(),
                format!("HTTP {status}"),
            ));
        }

        // Relative URIs resolve against where the manifest actually came from.
        let base = response.url().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobError::manifest_fetch(url.as_str(), e))?;

        let mut playlist = parse_playlist(&base, &bytes)?;
        playlist.url = url.clone();
        info!(
            url = %url,
            segments = playlist.segments.len(),
            encrypted = playlist.is_encrypted(),
            "Playlist loaded"
        );
        Ok(playlist)
    }
}
