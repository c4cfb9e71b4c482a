use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value.trim()).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "created" => Some(TaskStatus::Created),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "deleted" => Some(TaskStatus::Deleted),
            _ => None,
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            TaskStatus::Created | TaskStatus::Paused | TaskStatus::Failed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Deleted)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Ts,
    Mp4,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Ts => "ts",
            OutputFormat::Mp4 => "mp4",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ts" => Some(OutputFormat::Ts),
            "mp4" => Some(OutputFormat::Mp4),
            _ => None,
        }
    }
}

/// Inclusive range of playlist indices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentRange {
    pub start: usize,
    pub end: usize,
}

impl SegmentRange {
    /// Resolve optional bounds against a playlist of `len` segments.
    pub fn resolve(start: Option<usize>, end: Option<usize>, len: usize) -> CoreResult<Self> {
        if len == 0 {
            return Err(CoreError::MalformedPlaylist(
                "playlist does not contain any segments".to_string(),
            ));
        }
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(len - 1);
        if start > end || end >= len {
            return Err(CoreError::InvalidState(format!(
                "range {start}..={end} does not fit a playlist of {len} segments"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.end).contains(&index)
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostProcess {
    Skipped,
    Muxed { path: String },
    Failed { reason: String },
}

impl PostProcess {
    pub fn kind(&self) -> &'static str {
        match self {
            PostProcess::Skipped => "skipped",
            PostProcess::Muxed { .. } => "muxed",
            PostProcess::Failed { .. } => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            PostProcess::Skipped => None,
            PostProcess::Muxed { path } => Some(path),
            PostProcess::Failed { reason } => Some(reason),
        }
    }

    pub fn from_parts(kind: &str, detail: Option<String>) -> Option<Self> {
        match kind {
            "skipped" => Some(PostProcess::Skipped),
            "muxed" => Some(PostProcess::Muxed {
                path: detail.unwrap_or_default(),
            }),
            "failed" => Some(PostProcess::Failed {
                reason: detail.unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// What a caller supplies to create a task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub url: String,
    pub title: Option<String>,
    pub output_format: OutputFormat,
    pub start_segment: Option<usize>,
    pub end_segment: Option<usize>,
    pub decrypt: bool,
    pub concurrency: Option<usize>,
    pub headers: HashMap<String, String>,
    pub output_dir: Option<PathBuf>,
}

impl TaskOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            output_format: OutputFormat::Ts,
            start_segment: None,
            end_segment: None,
            decrypt: true,
            concurrency: None,
            headers: HashMap::new(),
            output_dir: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn range(mut self, start: usize, end: usize) -> Self {
        self.start_segment = Some(start);
        self.end_segment = Some(end);
        self
    }

    pub fn decrypt(mut self, decrypt: bool) -> Self {
        self.decrypt = decrypt;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub playlist_url: String,
    /// Raw playlist text, kept so the task can be rebuilt without refetching.
    pub playlist_text: String,
    pub title: String,
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub range: SegmentRange,
    pub decrypt: bool,
    pub concurrency: usize,
    pub headers: HashMap<String, String>,
    pub status: TaskStatus,
    pub bytes_completed: u64,
    pub message: Option<String>,
    pub output_path: Option<PathBuf>,
    pub post_process: Option<PostProcess>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    pub fn touch(&mut self) {
        self.updated_at = now_epoch();
    }

    pub fn set_status(&mut self, status: TaskStatus, message: impl Into<String>) {
        self.status = status;
        self.message = Some(message.into());
        self.touch();
    }

    /// In-progress output, named after the task so titles may collide safely.
    pub fn temp_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.download", self.id))
    }

    pub fn ts_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.ts", self.title))
    }

    pub fn partial_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.partial.ts", self.title))
    }

    pub fn container_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.title, self.output_format.as_str()))
    }
}

pub fn safe_title(title: &str) -> String {
    let candidate = title.trim();
    let candidate = if candidate.is_empty() { "video" } else { candidate };
    candidate
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .take(80)
        .collect()
}

/// Last path component of the playlist URL without its extension.
pub fn title_from_url(url: &str) -> String {
    let name = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    if stem.is_empty() {
        "video".to_string()
    } else {
        stem.to_string()
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_ranges() {
        assert_eq!(
            SegmentRange::resolve(None, None, 10).unwrap(),
            SegmentRange { start: 0, end: 9 }
        );
        let range = SegmentRange::resolve(Some(2), Some(5), 10).unwrap();
        assert_eq!(range.len(), 4);
        assert!(range.contains(2) && range.contains(5));
        assert!(!range.contains(1) && !range.contains(6));
        assert!(SegmentRange::resolve(Some(5), Some(2), 10).is_err());
        assert!(SegmentRange::resolve(Some(0), Some(10), 10).is_err());
    }

    #[test]
    fn sanitizes_titles() {
        assert_eq!(safe_title("  my show: ep/1 "), "my_show__ep_1");
        assert_eq!(safe_title(""), "video");
        assert_eq!(safe_title(&"x".repeat(200)).len(), 80);
        assert_eq!(title_from_url("https://a.example/path/index.m3u8?x=1"), "index");
        assert_eq!(title_from_url("https://a.example/"), "video");
    }

    #[test]
    fn task_ids_are_unique_and_parse_back() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(TaskId::parse_str(&a.to_string()).unwrap(), a);
        assert!(TaskId::parse_str("not-a-uuid").is_err());
    }
}
