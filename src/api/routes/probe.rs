//! Metadata probe route: title, platform, and available formats for a
//! source, without downloading anything.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::ProbeRequest;
use crate::api::server::AppState;
use crate::error::Stage;
use crate::runner::{ToolSpec, ToolStatus};
use crate::Error;
use crate::tools::extractor::{self, ProbeInfo};

/// Create the probe router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", post(probe))
}

/// Probe a source URL for metadata and downloadable formats.
///
/// Runs the extractor in metadata-only mode. Probes are cheap compared to
/// extractions and bypass the job scheduler; they still run under the stage
/// timeout.
#[utoipa::path(
    post,
    path = "/api/probe",
    tag = "probe",
    request_body = ProbeRequest,
    responses(
        (status = 200, description = "Source metadata", body = ProbeInfo),
        (status = 401, description = "Source requires login"),
        (status = 403, description = "Source is private"),
        (status = 404, description = "Source is unavailable"),
        (status = 422, description = "Malformed source or extractor rejection"),
        (status = 504, description = "Probe exceeded the stage timeout")
    )
)]
pub async fn probe(
    State(state): State<AppState>,
    Json(request): Json<ProbeRequest>,
) -> ApiResult<Json<ProbeInfo>> {
    let source = extractor::normalize_source(&request.source)?;

    let spec = ToolSpec {
        program: state.config.extractor_path.clone(),
        args: extractor::build_probe_args(&source),
        working_dir: std::env::temp_dir(),
        timeout: state.config.stage_timeout,
        capture_full_stdout: true,
    };

    let result = state.runner.run(&spec, &CancellationToken::new()).await?;

    match result.status {
        ToolStatus::Succeeded => {
            let info = extractor::parse_probe_output(source.as_str(), &result.stdout_tail)?;
            Ok(Json(info))
        }
        ToolStatus::TimedOut => Err(Error::ToolTimeout {
            stage: Stage::Extracting,
            timeout_secs: state.config.stage_timeout.as_secs(),
        }
        .into()),
        ToolStatus::Cancelled => Err(Error::Cancelled.into()),
        ToolStatus::Failed(_) => Err(probe_failure(&result.stderr_tail)),
    }
}

/// Map extractor stderr onto caller-meaningful statuses.
fn probe_failure(stderr_tail: &str) -> ApiError {
    let lower = stderr_tail.to_ascii_lowercase();

    if lower.contains("private") {
        return ApiError::new(
            StatusCode::FORBIDDEN,
            "SOURCE_PRIVATE",
            "This media is private and cannot be accessed",
        );
    }
    if lower.contains("unavailable") || lower.contains("not available") {
        return ApiError::new(
            StatusCode::NOT_FOUND,
            "SOURCE_UNAVAILABLE",
            "This media is unavailable",
        );
    }
    if lower.contains("login") || lower.contains("sign in") {
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "LOGIN_REQUIRED",
            "This media requires login to access",
        );
    }

    let detail = stderr_tail
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no extractor output");
    ApiError::validation(format!("Failed to extract metadata: {}", detail))
}
