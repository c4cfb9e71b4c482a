use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("unsafe url: {0}")]
    UnsafeUrl(String),
    #[error("unsupported playlist: {0}")]
    UnsupportedPlaylist(String),
    #[error("malformed playlist: {0}")]
    MalformedPlaylist(String),
    #[error("segment fetch failed: {0}")]
    SegmentFetch(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("muxing failed: {0}")]
    Muxing(String),
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("segment {index} is outside range {start}..={end}")]
    SegmentOutOfRange { index: usize, start: usize, end: usize },
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Classification recorded on a segment that exhausted its attempts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::UnsafeUrl(_) => ErrorKind::UnsafeUrl,
            CoreError::Decryption(_) => ErrorKind::Decryption,
            CoreError::Io(_) | CoreError::Storage(_) => ErrorKind::Io,
            _ => ErrorKind::Fetch,
        }
    }

    /// Whether another automatic attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::SegmentFetch(_) | CoreError::Network(_) | CoreError::Decryption(_)
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    UnsafeUrl,
    Fetch,
    Decryption,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsafeUrl => "unsafe_url",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Decryption => "decryption",
            ErrorKind::Io => "io",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "unsafe_url" => Some(ErrorKind::UnsafeUrl),
            "fetch" => Some(ErrorKind::Fetch),
            "decryption" => Some(ErrorKind::Decryption),
            "io" => Some(ErrorKind::Io),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
