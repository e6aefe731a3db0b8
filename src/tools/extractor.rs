//! Extractor (yt-dlp) invocation building and output interpretation.
//!
//! The extractor is a black box with a documented contract: it accepts a
//! source URL and an output template, writes media files into the working
//! directory, and exits non-zero on failure. Exit 0 with no output file is
//! `NoOutputProduced`, not success.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::runner::{ToolInvocationResult, ToolStatus};
use crate::{Error, Result};

/// Fixed output stem so the pipeline can locate what the extractor produced.
pub const OUTPUT_STEM: &str = "media";

/// Platforms recognized for informational classification. Sources outside
/// this list are still handed to the extractor, which supports far more
/// sites than we care to enumerate.
const PLATFORM_PATTERNS: &[(&str, &str)] = &[
    ("youtube", r"(?i)(youtube\.com|youtu\.be)"),
    ("tiktok", r"(?i)tiktok\.com"),
    ("instagram", r"(?i)instagram\.com"),
    ("facebook", r"(?i)(facebook\.com|fb\.watch)"),
    ("twitter", r"(?i)(twitter\.com|x\.com)"),
];

fn platform_regexes() -> &'static Vec<(&'static str, Regex)> {
    static REGEXES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        PLATFORM_PATTERNS
            .iter()
            .map(|(name, pattern)| (*name, Regex::new(pattern).expect("static pattern")))
            .collect()
    })
}

/// Classify the source URL's platform, if recognized.
pub fn detect_platform(source: &str) -> Option<&'static str> {
    platform_regexes()
        .iter()
        .find(|(_, re)| re.is_match(source))
        .map(|(name, _)| *name)
}

/// Validate and normalize a source identifier.
///
/// Trims whitespace, requires an http(s) URL, lowercases the host, and drops
/// the fragment so equivalent spellings produce equal job keys.
pub fn normalize_source(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_request("source must not be empty"));
    }

    let mut url = Url::parse(trimmed)
        .map_err(|e| Error::invalid_request(format!("source is not a valid URL: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_request(format!(
            "unsupported source scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::invalid_request("source URL has no host"));
    }

    url.set_fragment(None);
    if let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) {
        // set_host only fails for cannot-be-a-base URLs, excluded above.
        let _ = url.set_host(Some(&host));
    }

    Ok(url)
}

/// Build the download invocation arguments.
///
/// The output template pins the stem to [`OUTPUT_STEM`] so `locate_output`
/// can find the result by convention regardless of the source title.
pub fn build_extract_args(source: &Url) -> Vec<String> {
    vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-f".to_string(),
        "b".to_string(),
        "-o".to_string(),
        format!("{}.%(ext)s", OUTPUT_STEM),
        source.to_string(),
    ]
}

/// Build the metadata-only probe invocation arguments.
pub fn build_probe_args(source: &Url) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        source.to_string(),
    ]
}

/// Locate the media file the extractor produced in the workspace.
///
/// At least one non-empty `media.*` file must exist; its absence after a
/// zero exit is a distinct failure from the tool exiting non-zero. If the
/// extractor wrote several files the largest one is the artifact.
pub async fn locate_output(workspace: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(workspace)
        .await
        .map_err(|e| Error::io_path("reading workspace", workspace, e))?;

    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading workspace", workspace, e))?
    {
        let path = entry.path();
        if path.file_stem().and_then(|s| s.to_str()) != Some(OUTPUT_STEM) {
            continue;
        }
        let len = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => continue,
        };
        if len == 0 {
            continue;
        }
        if best.as_ref().is_none_or(|(size, _)| len > *size) {
            best = Some((len, path));
        }
    }

    best.map(|(_, path)| path).ok_or(Error::NoOutputProduced)
}

/// Whether a failed extraction looks network-transient and is therefore
/// eligible for the single automatic retry.
pub fn is_transient_failure(result: &ToolInvocationResult, transient: &Regex) -> bool {
    match result.status {
        ToolStatus::TimedOut => true,
        ToolStatus::Failed(_) => transient.is_match(&result.stderr_tail),
        ToolStatus::Succeeded | ToolStatus::Cancelled => false,
    }
}

/// One downloadable format reported by the probe.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize_approx: Option<u64>,
    pub has_audio: bool,
    pub has_video: bool,
}

/// Metadata for a source, as reported by the extractor's JSON probe.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProbeInfo {
    pub title: String,
    /// Recognized platform, or "unknown".
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub formats: Vec<FormatInfo>,
}

/// Parse the extractor's `-J` output into a [`ProbeInfo`].
///
/// Formats without a direct URL or without video are skipped, duplicates by
/// (resolution, ext, audio) collapse, and the result is sorted by vertical
/// resolution, highest first.
pub fn parse_probe_output(source: &str, json: &str) -> Result<ProbeInfo> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| Error::internal(format!("extractor returned invalid probe JSON: {}", e)))?;

    let title = value
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("Untitled")
        .to_string();

    let mut formats = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for f in value
        .get("formats")
        .and_then(|f| f.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        if f.get("url").and_then(|u| u.as_str()).is_none() {
            continue;
        }

        let vcodec = f.get("vcodec").and_then(|v| v.as_str()).unwrap_or("none");
        let acodec = f.get("acodec").and_then(|v| v.as_str()).unwrap_or("none");
        let has_video = vcodec != "none";
        let has_audio = acodec != "none";
        if !has_video {
            continue;
        }

        let ext = f
            .get("ext")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string();
        let height = f.get("height").and_then(|h| h.as_u64());
        let width = f.get("width").and_then(|w| w.as_u64());
        let resolution = match (width, height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            (None, Some(h)) => format!("{}p", h),
            _ => f
                .get("format_note")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
        };

        if !seen.insert(format!("{}_{}_{}", resolution, ext, has_audio)) {
            continue;
        }

        formats.push((
            height.unwrap_or(0),
            FormatInfo {
                format_id: f
                    .get("format_id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ext,
                resolution,
                filesize: f.get("filesize").and_then(|s| s.as_u64()),
                filesize_approx: f.get("filesize_approx").and_then(|s| s.as_u64()),
                has_audio,
                has_video,
            },
        ));
    }

    formats.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(ProbeInfo {
        title,
        platform: detect_platform(source).unwrap_or("unknown").to_string(),
        thumbnail: value
            .get("thumbnail")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string()),
        duration: value.get("duration").and_then(|d| d.as_f64()),
        formats: formats.into_iter().map(|(_, f)| f).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_detect_platform() {
        assert_eq!(detect_platform("https://www.youtube.com/watch?v=x"), Some("youtube"));
        assert_eq!(detect_platform("https://youtu.be/x"), Some("youtube"));
        assert_eq!(detect_platform("https://x.com/user/status/1"), Some("twitter"));
        assert_eq!(detect_platform("https://example.com/video"), None);
    }

    #[test]
    fn test_normalize_source_rejects_garbage() {
        assert!(matches!(normalize_source(""), Err(Error::InvalidRequest(_))));
        assert!(matches!(normalize_source("not a url"), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            normalize_source("ftp://example.com/file"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_normalize_source_canonicalizes() {
        let a = normalize_source(" https://YouTube.com/watch?v=abc#t=10 ").unwrap();
        let b = normalize_source("https://youtube.com/watch?v=abc").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_args_pin_output_stem() {
        let url = normalize_source("https://youtu.be/abc").unwrap();
        let args = build_extract_args(&url);
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&format!("{}.%(ext)s", OUTPUT_STEM)));
        assert_eq!(args.last().unwrap(), "https://youtu.be/abc");
    }

    #[tokio::test]
    async fn test_locate_output_prefers_largest_and_skips_empty() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("media.part"), b"").await.unwrap();
        tokio::fs::write(tmp.path().join("media.webm"), b"12").await.unwrap();
        tokio::fs::write(tmp.path().join("media.mp4"), b"123456").await.unwrap();
        tokio::fs::write(tmp.path().join("other.mp4"), b"xxxxxxxxxx").await.unwrap();

        let found = locate_output(tmp.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "media.mp4");
    }

    #[tokio::test]
    async fn test_locate_output_empty_workspace_is_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            locate_output(tmp.path()).await,
            Err(Error::NoOutputProduced)
        ));
    }

    #[test]
    fn test_transient_classification() {
        let re = Regex::new(crate::config::default_transient_pattern()).unwrap();
        let result = |status, stderr: &str| ToolInvocationResult {
            status,
            stdout_tail: String::new(),
            stderr_tail: stderr.to_string(),
            duration: Duration::from_secs(1),
        };

        assert!(is_transient_failure(&result(ToolStatus::TimedOut, ""), &re));
        assert!(is_transient_failure(
            &result(ToolStatus::Failed(1), "ERROR: Connection reset by peer"),
            &re
        ));
        assert!(!is_transient_failure(
            &result(ToolStatus::Failed(1), "ERROR: Unsupported URL"),
            &re
        ));
        assert!(!is_transient_failure(&result(ToolStatus::Cancelled, ""), &re));
    }

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "title": "Test clip",
            "thumbnail": "https://example.com/t.jpg",
            "duration": 12.5,
            "formats": [
                {"format_id": "18", "ext": "mp4", "url": "https://cdn/x", "width": 640, "height": 360, "vcodec": "avc1", "acodec": "mp4a", "filesize": 1000},
                {"format_id": "22", "ext": "mp4", "url": "https://cdn/y", "width": 1280, "height": 720, "vcodec": "avc1", "acodec": "mp4a"},
                {"format_id": "audio", "ext": "m4a", "url": "https://cdn/a", "vcodec": "none", "acodec": "mp4a"},
                {"format_id": "dup", "ext": "mp4", "url": "https://cdn/z", "width": 1280, "height": 720, "vcodec": "avc1", "acodec": "mp4a"},
                {"format_id": "nourl", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a"}
            ]
        }"#;

        let info = parse_probe_output("https://youtu.be/abc", json).unwrap();
        assert_eq!(info.title, "Test clip");
        assert_eq!(info.platform, "youtube");
        assert_eq!(info.duration, Some(12.5));
        // Audio-only, duplicate, and url-less formats are dropped.
        assert_eq!(info.formats.len(), 2);
        // Sorted highest resolution first.
        assert_eq!(info.formats[0].resolution, "1280x720");
        assert_eq!(info.formats[1].filesize, Some(1000));
    }

    #[test]
    fn test_parse_probe_output_invalid_json() {
        assert!(parse_probe_output("https://youtu.be/abc", "not json").is_err());
    }
}
