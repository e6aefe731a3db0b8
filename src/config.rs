//! Runtime configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How completed artifacts are delivered to HTTP callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// `POST /api/extract` waits for the terminal result and streams the
    /// artifact in the response.
    Stream,
    /// `POST /api/extract` returns `202` with a job id; callers poll
    /// `GET /api/jobs/{id}` and fetch content separately.
    Poll,
}

/// Pipeline and service configuration.
///
/// Every knob has an environment override; see `from_env_or_default`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for per-job scratch workspaces.
    pub workspace_root: PathBuf,
    /// Maximum simultaneously running jobs.
    pub max_concurrent_jobs: usize,
    /// Maximum queued (admitted but not yet running) jobs.
    pub max_queue_depth: usize,
    /// Hard wall-clock timeout applied to each pipeline stage.
    pub stage_timeout: Duration,
    /// How long a completed artifact is retained after its job finishes.
    pub retention: Duration,
    /// Minimum free disk space below which workspace allocation fails fast.
    pub min_free_bytes: u64,
    /// Grace period between the termination signal and the forced kill.
    pub kill_grace: Duration,
    /// Artifact delivery mode.
    pub delivery_mode: DeliveryMode,
    /// Serve the raw extracted file when transcoding fails. Off by default;
    /// failing hard is the only behavior callers can rely on otherwise.
    pub transcode_fallback: bool,
    /// Path to the extractor binary.
    pub extractor_path: String,
    /// Path to the transcoder binary.
    pub transcoder_path: String,
    /// Regex matched against the extractor's stderr tail to classify a
    /// failure as transient (eligible for the single automatic retry).
    pub transient_pattern: String,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("ripd"),
            max_concurrent_jobs: 2,
            max_queue_depth: 16,
            stage_timeout: Duration::from_secs(600),
            retention: Duration::from_secs(15 * 60),
            min_free_bytes: 512 * 1024 * 1024,
            kill_grace: Duration::from_secs(5),
            delivery_mode: DeliveryMode::Stream,
            transcode_fallback: false,
            extractor_path: "yt-dlp".to_string(),
            transcoder_path: "ffmpeg".to_string(),
            transient_pattern: default_transient_pattern().to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Stderr patterns that mark an extraction failure as network-transient.
pub fn default_transient_pattern() -> &'static str {
    r"(?i)timed? ?out|connection reset|temporar(y|ily)|network is unreachable|name resolution|EOF occurred"
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// Supported env vars:
    /// - `RIPD_WORKSPACE_ROOT`
    /// - `RIPD_MAX_CONCURRENT_JOBS`
    /// - `RIPD_MAX_QUEUE_DEPTH`
    /// - `RIPD_STAGE_TIMEOUT_SECS`
    /// - `RIPD_RETENTION_SECS`
    /// - `RIPD_MIN_FREE_BYTES`
    /// - `RIPD_KILL_GRACE_SECS`
    /// - `RIPD_DELIVERY_MODE` ("stream" | "poll")
    /// - `RIPD_TRANSCODE_FALLBACK` ("true" | "false")
    /// - `RIPD_EXTRACTOR_PATH`
    /// - `RIPD_TRANSCODER_PATH`
    /// - `RIPD_TRANSIENT_PATTERN`
    /// - `RIPD_LOG_DIR`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(root) = env_string("RIPD_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(max) = env_parse::<usize>("RIPD_MAX_CONCURRENT_JOBS")
            && max > 0
        {
            config.max_concurrent_jobs = max;
        }
        if let Some(depth) = env_parse::<usize>("RIPD_MAX_QUEUE_DEPTH") {
            config.max_queue_depth = depth;
        }
        if let Some(secs) = env_parse::<u64>("RIPD_STAGE_TIMEOUT_SECS")
            && secs > 0
        {
            config.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RIPD_RETENTION_SECS") {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<u64>("RIPD_MIN_FREE_BYTES") {
            config.min_free_bytes = bytes;
        }
        if let Some(secs) = env_parse::<u64>("RIPD_KILL_GRACE_SECS")
            && secs > 0
        {
            config.kill_grace = Duration::from_secs(secs);
        }
        if let Some(mode) = env_string("RIPD_DELIVERY_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "poll" => config.delivery_mode = DeliveryMode::Poll,
                "stream" => config.delivery_mode = DeliveryMode::Stream,
                other => {
                    tracing::warn!("Unknown RIPD_DELIVERY_MODE '{}', keeping default", other)
                }
            }
        }
        if let Some(fallback) = env_parse::<bool>("RIPD_TRANSCODE_FALLBACK") {
            config.transcode_fallback = fallback;
        }
        if let Some(path) = env_string("RIPD_EXTRACTOR_PATH") {
            config.extractor_path = path;
        }
        if let Some(path) = env_string("RIPD_TRANSCODER_PATH") {
            config.transcoder_path = path;
        }
        if let Some(pattern) = env_string("RIPD_TRANSIENT_PATTERN") {
            match regex::Regex::new(&pattern) {
                Ok(_) => config.transient_pattern = pattern,
                Err(e) => {
                    tracing::warn!("Invalid RIPD_TRANSIENT_PATTERN, keeping default: {}", e)
                }
            }
        }
        if let Some(dir) = env_string("RIPD_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        config
    }
}
