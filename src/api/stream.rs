//! Artifact delivery: reader-count-guarded, chunked, range-capable.
//!
//! The response body never holds the whole file in memory; it streams in
//! bounded chunks and carries the read guard, so the reader count drops on
//! normal completion and on client disconnect alike (the body is dropped
//! either way).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::pipeline::artifact::{ArtifactDescriptor, ArtifactReadGuard};

/// Streaming chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// A byte stream that keeps the artifact's read guard alive until dropped.
struct GuardedStream<S> {
    inner: S,
    _guard: ArtifactReadGuard,
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// A single requested byte range, inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

/// Parse a `Range` header against an artifact of `len` bytes.
///
/// Only single ranges are honored; multipart ranges and malformed headers
/// fall back to a full response (`None`), per the lenient reading of RFC
/// 9110. Syntactically valid but unsatisfiable ranges are `Err`.
fn parse_range(header: &str, len: u64) -> Result<Option<ByteRange>, ()> {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };

    let range = match (start_str.trim(), end_str.trim()) {
        // bytes=-suffix
        ("", suffix) => {
            let Ok(suffix_len) = suffix.parse::<u64>() else {
                return Ok(None);
            };
            if suffix_len == 0 {
                return Err(());
            }
            ByteRange {
                start: len.saturating_sub(suffix_len),
                end: len.saturating_sub(1),
            }
        }
        // bytes=start-
        (start, "") => {
            let Ok(start) = start.parse::<u64>() else {
                return Ok(None);
            };
            ByteRange {
                start,
                end: len.saturating_sub(1),
            }
        }
        // bytes=start-end
        (start, end) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return Ok(None);
            };
            if end < start {
                return Ok(None);
            }
            ByteRange {
                start,
                end: end.min(len.saturating_sub(1)),
            }
        }
    };

    if len == 0 || range.start >= len {
        return Err(());
    }
    Ok(Some(range))
}

/// Stream an artifact to an HTTP caller.
///
/// Increments the reader count before the first byte and decrements it when
/// the body is dropped. Honors single-range requests with `206`.
pub async fn artifact_response(
    artifact: &Arc<ArtifactDescriptor>,
    range_header: Option<&str>,
) -> ApiResult<Response> {
    let len = artifact.len();

    let range = match range_header {
        Some(header) => match parse_range(header, len) {
            Ok(range) => range,
            Err(()) => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", len))
                    .body(Body::empty())
                    .map_err(|e| ApiError::internal(e.to_string()));
            }
        },
        None => None,
    };

    let mut file = tokio::fs::File::open(artifact.path())
        .await
        .map_err(|e| ApiError::internal(format!("Failed to open artifact: {}", e)))?;

    // Register the reader only after the file is open; nothing to undo on
    // the error paths above.
    let guard = artifact.open_reader();

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, artifact.content_type())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(artifact.download_name()),
        );

    let response = match range {
        Some(range) => {
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| ApiError::internal(format!("Failed to seek artifact: {}", e)))?;
            let span = range.end - range.start + 1;
            let reader = file.take(span);

            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, len),
                )
                .header(header::CONTENT_LENGTH, span)
                .body(Body::from_stream(GuardedStream {
                    inner: ReaderStream::with_capacity(reader, CHUNK_SIZE),
                    _guard: guard,
                }))
        }
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::from_stream(GuardedStream {
                inner: ReaderStream::with_capacity(file, CHUNK_SIZE),
                _guard: guard,
            })),
    };

    response.map_err(|e| ApiError::internal(e.to_string()))
}

fn content_disposition(download_name: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", download_name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
