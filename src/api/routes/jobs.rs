//! Job status, artifact content, listing, and cancellation routes.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{JobListResponse, JobResponse, PaginationParams};
use crate::api::server::AppState;
use crate::api::stream::artifact_response;
use crate::pipeline::job::{Job, JobState};
use crate::pipeline::scheduler::CancelOutcome;

/// Create the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job).delete(cancel_job))
        .route("/{id}/content", get(get_job_content))
}

fn lookup(state: &AppState, id: &str) -> ApiResult<Job> {
    state
        .scheduler
        .registry()
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {}", id)))
}

/// List known jobs, newest first.
#[utoipa::path(
    get,
    path = "/api/jobs",
    tag = "jobs",
    params(PaginationParams),
    responses(
        (status = 200, description = "Job listing", body = JobListResponse)
    )
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(pagination): Query<PaginationParams>,
) -> ApiResult<Json<JobListResponse>> {
    let jobs = state.scheduler.registry().snapshot();
    let total = jobs.len() as u64;
    let items = jobs
        .iter()
        .skip(pagination.offset as usize)
        .take(pagination.clamped_limit())
        .map(JobResponse::from)
        .collect();

    Ok(Json(JobListResponse {
        items,
        total,
        limit: pagination.limit,
        offset: pagination.offset,
    }))
}

/// Get a job status snapshot.
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job status", body = JobResponse),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = lookup(&state, &id)?;
    Ok(Json(JobResponse::from(&job)))
}

/// Stream a completed job's artifact.
#[utoipa::path(
    get,
    path = "/api/jobs/{id}/content",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Artifact content"),
        (status = 206, description = "Partial artifact content"),
        (status = 404, description = "Unknown job or artifact not ready"),
        (status = 416, description = "Unsatisfiable range")
    )
)]
pub async fn get_job_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let job = lookup(&state, &id)?;

    let Some(artifact) = (job.state == JobState::Completed)
        .then_some(job.artifact.as_ref())
        .flatten()
    else {
        return Err(ApiError::not_found(format!(
            "Job {} has no artifact (state: {:?})",
            id, job.state
        )));
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    artifact_response(artifact, range).await
}

/// Cancel a queued or running job.
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Cancellation requested", body = JobResponse),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job already reached a terminal state")
    )
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(axum::http::StatusCode, Json<JobResponse>)> {
    match state.scheduler.cancel(&id)? {
        CancelOutcome::Requested(job) => Ok((
            axum::http::StatusCode::ACCEPTED,
            Json(JobResponse::from(&job)),
        )),
        CancelOutcome::AlreadyTerminal(job) => Err(ApiError::conflict(format!(
            "Job {} already finished (state: {:?})",
            job.id, job.state
        ))),
    }
}
