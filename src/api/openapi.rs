//! OpenAPI documentation configuration.
//!
//! Configures OpenAPI 3.0 specification generation using `utoipa` and serves
//! Swagger UI for interactive API exploration.

use utoipa::OpenApi;

use crate::api::error::ApiErrorResponse;
use crate::api::models::{
    ArtifactInfo, ExtractRequest, HealthResponse, JobAccepted, JobListResponse, JobResponse,
    ProbeRequest,
};
use crate::error::Stage;
use crate::pipeline::job::{JobErrorInfo, JobState};
use crate::tools::extractor::{FormatInfo, ProbeInfo};

/// OpenAPI documentation for the ripd API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ripd API",
        version = "0.1.0",
        description = "REST API for the ripd media extraction service. Submit a source URL, optionally pick an output format, and download the resulting artifact.",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:7860", description = "Local server")
    ),
    tags(
        (name = "extract", description = "Extraction job submission"),
        (name = "jobs", description = "Job status, artifact delivery, and cancellation"),
        (name = "probe", description = "Source metadata and format discovery"),
        (name = "health", description = "Health check endpoints for monitoring and orchestration")
    ),
    paths(
        crate::api::routes::extract::extract,
        crate::api::routes::jobs::list_jobs,
        crate::api::routes::jobs::get_job,
        crate::api::routes::jobs::get_job_content,
        crate::api::routes::jobs::cancel_job,
        crate::api::routes::probe::probe,
        crate::api::routes::health::health_check,
        crate::api::routes::health::liveness_check
    ),
    components(schemas(
        ExtractRequest,
        JobAccepted,
        JobResponse,
        JobListResponse,
        ArtifactInfo,
        JobState,
        JobErrorInfo,
        Stage,
        ProbeRequest,
        ProbeInfo,
        FormatInfo,
        HealthResponse,
        ApiErrorResponse
    ))
)]
pub struct ApiDoc;
