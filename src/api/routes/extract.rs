//! Extraction submission route.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{ExtractRequest, JobAccepted};
use crate::api::server::AppState;
use crate::api::stream::artifact_response;
use crate::config::DeliveryMode;
use crate::pipeline::job::{JobRequest, JobState};

/// Create the extract router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", post(extract))
}

/// Submit an extraction job.
///
/// In `stream` delivery mode the response is the artifact itself (the call
/// waits for the job); in `poll` mode the job is accepted with `202` and the
/// caller polls `/api/jobs/{id}`.
#[utoipa::path(
    post,
    path = "/api/extract",
    tag = "extract",
    request_body = ExtractRequest,
    responses(
        (status = 200, description = "Artifact delivered (stream mode)"),
        (status = 202, description = "Job accepted (poll mode)", body = JobAccepted),
        (status = 422, description = "Malformed source or unsupported format"),
        (status = 429, description = "Scheduler slots and queue are full"),
        (status = 500, description = "Extraction or transcode failed"),
        (status = 504, description = "A pipeline stage exceeded its timeout")
    )
)]
pub async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExtractRequest>,
) -> ApiResult<Response> {
    let job_request = JobRequest::parse(&request.source, request.format.as_deref())?;
    let outcome = state.scheduler.submit(job_request)?;

    match state.config.delivery_mode {
        DeliveryMode::Poll => {
            let state_snapshot = state
                .scheduler
                .registry()
                .get(outcome.execution.job_id())
                .map(|job| job.state)
                .unwrap_or(JobState::Queued);

            let accepted = JobAccepted {
                job_id: outcome.execution.job_id().to_string(),
                key: outcome.execution.key().prefix().to_string(),
                state: state_snapshot,
            };
            Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
        }
        DeliveryMode::Stream => {
            let artifact = outcome.execution.wait().await.map_err(ApiError::from)?;
            let range = headers
                .get(header::RANGE)
                .and_then(|value| value.to_str().ok());
            artifact_response(&artifact, range).await
        }
    }
}
