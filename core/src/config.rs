use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_concurrency: usize,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    pub progress_window: Duration,
    /// Segment settlements between two storage writes while running.
    pub persist_every_segments: usize,
    pub abort_on_segment_failure: bool,
    pub output_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 8,
            retry_count: 3,
            retry_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            max_redirects: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            progress_window: Duration::from_secs(5),
            persist_every_segments: 1,
            abort_on_segment_failure: false,
            output_dir: PathBuf::from("files"),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `HLSDL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse::<usize>("HLSDL_CONCURRENCY") {
            config.default_concurrency = value.max(1);
        }
        if let Some(value) = env_parse::<u32>("HLSDL_RETRIES") {
            config.retry_count = value;
        }
        if let Some(value) = env_parse::<u64>("HLSDL_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(value);
        }
        if let Some(value) = env_parse::<u64>("HLSDL_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(value.max(1));
        }
        if let Ok(value) = env::var("HLSDL_USER_AGENT") {
            if !value.trim().is_empty() {
                config.user_agent = value;
            }
        }
        if let Ok(value) = env::var("HLSDL_ABORT_ON_FAILURE") {
            config.abort_on_segment_failure =
                matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(dir) = env::var("HLSDL_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse::<T>().ok())
}
