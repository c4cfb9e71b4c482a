use m3u8_rs::{KeyMethod, Playlist as M3u8Playlist};
use url::Url;

use crate::crypto::parse_iv;
use crate::error::{CoreError, CoreResult};

const VARIANT_TAGS: [&str; 2] = ["#EXT-X-STREAM-INF", "#EXT-X-I-FRAME-STREAM-INF"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub url: Url,
    pub iv: Option<[u8; 16]>,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub index: usize,
    pub url: Url,
    pub duration: f32,
    /// Length from `#EXT-X-BYTERANGE`, when the playlist gives one.
    pub byte_length: Option<u64>,
    key: Option<usize>,
}

/// A parsed media playlist. Never mutated after parsing.
#[derive(Debug, Clone)]
pub struct Playlist {
    url: Url,
    media_sequence: u64,
    segments: Vec<SegmentInfo>,
    keys: Vec<EncryptionKey>,
}

impl Playlist {
    pub fn parse(content: &[u8], playlist_url: &str) -> CoreResult<Self> {
        let base = Url::parse(playlist_url).map_err(|err| {
            CoreError::MalformedPlaylist(format!("invalid playlist url {playlist_url}: {err}"))
        })?;
        let text = String::from_utf8_lossy(content);
        let text = text.trim_start_matches('\u{feff}').trim_start();
        if !text.starts_with("#EXTM3U") {
            return Err(CoreError::MalformedPlaylist("missing #EXTM3U header".to_string()));
        }
        if text
            .lines()
            .any(|line| VARIANT_TAGS.iter().any(|tag| line.trim_start().starts_with(tag)))
        {
            return Err(variant_error());
        }
        check_durations(text)?;

        let media = match m3u8_rs::parse_playlist(text.as_bytes()) {
            Ok((_, M3u8Playlist::MediaPlaylist(media))) => media,
            Ok((_, M3u8Playlist::MasterPlaylist(_))) => return Err(variant_error()),
            Err(err) => {
                return Err(CoreError::MalformedPlaylist(format!(
                    "failed to parse m3u8 playlist: {err}"
                )))
            }
        };

        let cleared = cleared_keys(text);
        let mut keys: Vec<EncryptionKey> = Vec::new();
        let mut current_key: Option<usize> = None;
        let mut segments = Vec::with_capacity(media.segments.len());

        for (index, segment) in media.segments.iter().enumerate() {
            // m3u8-rs drops METHOD=NONE tags, so they are read from the text.
            if cleared.get(index).copied().unwrap_or(false) {
                current_key = None;
            } else if let Some(key) = &segment.key {
                current_key = match &key.method {
                    KeyMethod::None => None,
                    KeyMethod::AES128 => {
                        let uri = key.uri.as_deref().ok_or_else(|| {
                            CoreError::MalformedPlaylist("AES-128 key without URI".to_string())
                        })?;
                        let iv = key
                            .iv
                            .as_deref()
                            .map(parse_iv)
                            .transpose()
                            .map_err(|err| CoreError::MalformedPlaylist(err.to_string()))?;
                        let descriptor = EncryptionKey {
                            url: join(&base, uri)?,
                            iv,
                        };
                        match keys.iter().position(|existing| existing == &descriptor) {
                            Some(position) => Some(position),
                            None => {
                                keys.push(descriptor);
                                Some(keys.len() - 1)
                            }
                        }
                    }
                    other => {
                        return Err(CoreError::UnsupportedPlaylist(format!(
                            "encryption method {other:?} is not supported, only AES-128"
                        )))
                    }
                };
            }

            if !segment.duration.is_finite() || segment.duration < 0.0 {
                return Err(CoreError::MalformedPlaylist(format!(
                    "segment {index} has invalid duration {}",
                    segment.duration
                )));
            }

            segments.push(SegmentInfo {
                index,
                url: join(&base, &segment.uri)?,
                duration: segment.duration,
                byte_length: segment.byte_range.as_ref().map(|range| range.length),
                key: current_key,
            });
        }

        if segments.is_empty() {
            return Err(CoreError::MalformedPlaylist(
                "playlist does not contain any segments".to_string(),
            ));
        }

        Ok(Self {
            url: base,
            media_sequence: media.media_sequence,
            segments,
            keys,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&SegmentInfo> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First key declared by the playlist.
    pub fn key(&self) -> Option<&EncryptionKey> {
        self.keys.first()
    }

    pub fn keys(&self) -> &[EncryptionKey] {
        &self.keys
    }

    pub fn key_for(&self, segment: &SegmentInfo) -> Option<&EncryptionKey> {
        segment.key.and_then(|position| self.keys.get(position))
    }

    /// Absolute media sequence number of the segment at `index`.
    pub fn sequence_number(&self, index: usize) -> u64 {
        self.media_sequence.wrapping_add(index as u64)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration as f64).sum()
    }

    /// Sum of byte-range hints over `start..=end`, if every segment has one.
    pub fn hinted_bytes(&self, start: usize, end: usize) -> Option<u64> {
        self.segments
            .get(start..=end)?
            .iter()
            .map(|segment| segment.byte_length)
            .sum()
    }
}

fn variant_error() -> CoreError {
    CoreError::UnsupportedPlaylist(
        "variant playlists are not supported, provide a media playlist url".to_string(),
    )
}

fn join(base: &Url, uri: &str) -> CoreResult<Url> {
    base.join(uri.trim()).map_err(|err| {
        CoreError::MalformedPlaylist(format!("cannot resolve {uri} against {base}: {err}"))
    })
}

fn check_durations(text: &str) -> CoreResult<()> {
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("#EXTINF:") else {
            continue;
        };
        let value = rest.split(',').next().unwrap_or_default().trim();
        if value.parse::<f32>().is_err() {
            return Err(CoreError::MalformedPlaylist(format!(
                "unparseable segment duration {value:?}"
            )));
        }
    }
    Ok(())
}

/// For each segment, whether the last `#EXT-X-KEY` before its URI line was
/// `METHOD=NONE`.
fn cleared_keys(text: &str) -> Vec<bool> {
    let mut cleared = Vec::new();
    let mut pending = false;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            pending = attrs.split(',').any(|attr| {
                attr.split_once('=')
                    .map(|(name, value)| {
                        name.trim() == "METHOD" && value.trim().trim_matches('"') == "NONE"
                    })
                    .unwrap_or(false)
            });
        } else if !line.starts_with('#') {
            cleared.push(pending);
            pending = false;
        }
    }
    cleared
}
