use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::crypto;
use crate::error::{CoreError, CoreResult};
use crate::net::{FetchRequest, FetchResponse, NetClient};
use crate::playlist::{EncryptionKey, SegmentInfo};
use crate::safety::UrlValidator;
use crate::segment::SegmentState;

/// Decryption inputs for one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentKey<'a> {
    pub key: &'a EncryptionKey,
    pub sequence_number: u64,
}

/// Downloads playlists, keys and segments for one task. Every request, retry
/// and redirect hop goes through the URL validator first.
pub struct SegmentFetcher {
    net: Arc<dyn NetClient>,
    validator: UrlValidator,
    user_agent: String,
    headers: HashMap<String, String>,
    retry_count: u32,
    retry_backoff: Duration,
    max_redirects: usize,
    // Held across the key request so concurrent workers fetch each key once.
    keys: Mutex<HashMap<Url, [u8; 16]>>,
}

impl SegmentFetcher {
    pub fn new(
        net: Arc<dyn NetClient>,
        validator: UrlValidator,
        config: &EngineConfig,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            net,
            validator,
            user_agent: config.user_agent.clone(),
            headers,
            retry_count: config.retry_count,
            retry_backoff: config.retry_backoff,
            max_redirects: config.max_redirects,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the final URL (after redirects) and the playlist body.
    pub fn fetch_playlist(&self, url: &str) -> CoreResult<(Url, Vec<u8>)> {
        let url = self.validator.validate(url)?.url;
        self.with_retries(&url, |_| {
            let (final_url, resp) = self.get_validated(&url)?;
            if !resp.is_success() {
                return Err(CoreError::Network(format!(
                    "playlist request failed with status {}",
                    resp.status_code
                )));
            }
            Ok((final_url, resp.body))
        })
    }

    pub fn key_bytes(&self, key: &EncryptionKey) -> CoreResult<[u8; 16]> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| CoreError::Decryption("key cache lock poisoned".to_string()))?;
        if let Some(bytes) = keys.get(&key.url) {
            return Ok(*bytes);
        }
        let body = self.with_retries(&key.url, |_| {
            let (_, resp) = self.get_validated(&key.url)?;
            if !resp.is_success() {
                return Err(CoreError::SegmentFetch(format!(
                    "key request failed with status {}",
                    resp.status_code
                )));
            }
            Ok(resp.body)
        })?;
        let bytes: [u8; 16] = body.as_slice().try_into().map_err(|_| {
            CoreError::Decryption(format!(
                "key from {} has {} bytes, expected 16",
                key.url,
                body.len()
            ))
        })?;
        debug!(url = %key.url, "fetched decryption key");
        keys.insert(key.url.clone(), bytes);
        Ok(bytes)
    }

    /// Fetch one segment, decrypting it when `key` is given. `on_stage` is
    /// told when an attempt enters the download and decrypt stages.
    pub fn fetch_segment(
        &self,
        segment: &SegmentInfo,
        key: Option<SegmentKey<'_>>,
        mut on_stage: impl FnMut(SegmentState),
    ) -> CoreResult<Vec<u8>> {
        self.with_retries(&segment.url, |_| {
            on_stage(SegmentState::Downloading);
            let (_, resp) = self.get_validated(&segment.url)?;
            let body = check_segment_response(segment, resp)?;
            match key {
                Some(SegmentKey {
                    key,
                    sequence_number,
                }) => {
                    on_stage(SegmentState::Decrypting);
                    let key_bytes = self.key_bytes(key)?;
                    crypto::decrypt(&body, &key_bytes, sequence_number, key.iv.as_ref())
                }
                None => Ok(body),
            }
        })
    }

    fn with_retries<T>(&self, url: &Url, mut op: impl FnMut(u32) -> CoreResult<T>) -> CoreResult<T> {
        let mut attempt = 0u32;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry_count => {
                    warn!(%url, attempt, error = %err, "request failed, retrying");
                    attempt += 1;
                    if !self.retry_backoff.is_zero() {
                        thread::sleep(self.retry_backoff);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn get_validated(&self, url: &Url) -> CoreResult<(Url, FetchResponse)> {
        let mut current = url.clone();
        for _ in 0..=self.max_redirects {
            let checked = self.validator.validate_url(&current)?;
            let mut req = FetchRequest::new(current.to_string(), self.user_agent.clone());
            req.headers = self.headers.clone();
            req.pinned = checked.domain.map(|domain| (domain, checked.addrs));

            let resp = self.net.get(&req)?;
            if !resp.is_redirect() {
                return Ok((current, resp));
            }
            let location = resp.location.as_deref().ok_or_else(|| {
                CoreError::SegmentFetch(format!("redirect from {current} without location"))
            })?;
            let next = current.join(location).map_err(|err| {
                CoreError::SegmentFetch(format!("bad redirect location {location}: {err}"))
            })?;
            debug!(from = %current, to = %next, "following redirect");
            current = next;
        }
        Err(CoreError::SegmentFetch(format!(
            "too many redirects starting at {url}"
        )))
    }
}

fn check_segment_response(segment: &SegmentInfo, resp: FetchResponse) -> CoreResult<Vec<u8>> {
    if !resp.is_success() {
        return Err(CoreError::SegmentFetch(format!(
            "segment {} returned status {}",
            segment.index, resp.status_code
        )));
    }
    if resp.body.is_empty() {
        return Err(CoreError::SegmentFetch(format!(
            "segment {} returned an empty body",
            segment.index
        )));
    }
    if let Some(expected) = resp.content_length {
        if expected != resp.body.len() as u64 {
            return Err(CoreError::SegmentFetch(format!(
                "segment {} truncated: {} of {} bytes",
                segment.index,
                resp.body.len(),
                expected
            )));
        }
    }
    Ok(resp.body)
}
