//! Transcoder (ffmpeg) invocation building and output format knowledge.

use std::path::Path;

use crate::{Error, Result};

/// A supported output format with its transcode recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Container/file extension, also the request hint spelling.
    pub ext: &'static str,
    /// MIME type served with artifacts of this format.
    pub content_type: &'static str,
    /// Audio-only formats drop the video stream instead of copying it.
    pub audio_only: bool,
    /// Codec arguments passed to the transcoder.
    codec_args: &'static [&'static str],
}

/// Formats the service can produce. Video targets default to stream copy
/// (container rewrite); webm is the exception because mp4 codecs cannot be
/// copied into it. Audio targets re-encode.
const FORMATS: &[OutputFormat] = &[
    OutputFormat {
        ext: "mp4",
        content_type: "video/mp4",
        audio_only: false,
        codec_args: &["-c", "copy", "-movflags", "+faststart"],
    },
    OutputFormat {
        ext: "mkv",
        content_type: "video/x-matroska",
        audio_only: false,
        codec_args: &["-c", "copy"],
    },
    OutputFormat {
        ext: "mov",
        content_type: "video/quicktime",
        audio_only: false,
        codec_args: &["-c", "copy"],
    },
    OutputFormat {
        ext: "webm",
        content_type: "video/webm",
        audio_only: false,
        codec_args: &["-c:v", "libvpx-vp9", "-c:a", "libopus"],
    },
    OutputFormat {
        ext: "mp3",
        content_type: "audio/mpeg",
        audio_only: true,
        codec_args: &["-vn", "-c:a", "libmp3lame", "-q:a", "2"],
    },
    OutputFormat {
        ext: "m4a",
        content_type: "audio/mp4",
        audio_only: true,
        codec_args: &["-vn", "-c:a", "aac"],
    },
    OutputFormat {
        ext: "opus",
        content_type: "audio/ogg",
        audio_only: true,
        codec_args: &["-vn", "-c:a", "libopus"],
    },
    OutputFormat {
        ext: "wav",
        content_type: "audio/wav",
        audio_only: true,
        codec_args: &["-vn", "-c:a", "pcm_s16le"],
    },
];

/// Resolve a requested format hint. Unknown hints are an `InvalidRequest`,
/// reported before any work is admitted.
pub fn parse_format(hint: &str) -> Result<&'static OutputFormat> {
    let normalized = hint.trim().trim_start_matches('.').to_ascii_lowercase();
    FORMATS
        .iter()
        .find(|f| f.ext == normalized)
        .ok_or_else(|| {
            Error::invalid_request(format!(
                "unsupported output format '{}' (supported: {})",
                hint,
                FORMATS
                    .iter()
                    .map(|f| f.ext)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// All supported format hints, for API documentation and error messages.
pub fn supported_formats() -> Vec<&'static str> {
    FORMATS.iter().map(|f| f.ext).collect()
}

/// Whether the extracted file already satisfies the requested format.
pub fn needs_transcode(extracted: &Path, requested: &OutputFormat) -> bool {
    extracted
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| !e.eq_ignore_ascii_case(requested.ext))
        .unwrap_or(true)
}

/// Build the transcode invocation arguments.
pub fn build_transcode_args(input: &Path, output: &Path, format: &OutputFormat) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];
    args.extend(format.codec_args.iter().map(|a| a.to_string()));
    args.push(output.to_string_lossy().to_string());
    args
}

/// MIME type for an artifact file, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ext) = ext.as_deref()
        && let Some(format) = FORMATS.iter().find(|f| f.ext == ext)
    {
        return format.content_type;
    }

    match ext.as_deref() {
        Some("flv") => "video/x-flv",
        Some("ts") => "video/mp2t",
        Some("3gp") => "video/3gpp",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}
