//! API request and response models (DTOs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::job::{Job, JobErrorInfo, JobState};

/// Request to extract media from a source URL.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct ExtractRequest {
    /// Source URL to extract media from
    pub source: String,
    /// Desired output format (e.g. "mp4", "mp3"); omitted means "whatever
    /// the extractor produces"
    #[serde(default)]
    pub format: Option<String>,
}

/// Response for an accepted (poll-mode) extraction job.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobAccepted {
    /// Job id to poll at `/api/jobs/{id}`
    pub job_id: String,
    /// Deduplication key prefix; identical requests share a job
    pub key: String,
    pub state: JobState,
}

/// Completed artifact metadata.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ArtifactInfo {
    pub content_type: String,
    pub size_bytes: u64,
    /// Suggested download filename
    pub download_name: String,
    /// Active readers currently streaming this artifact
    pub readers: usize,
}

/// Job status snapshot.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: String,
    /// Deduplication key prefix
    pub key: String,
    pub source: String,
    /// Recognized platform, or "unknown"
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_format: Option<String>,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactInfo>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            key: job.key.prefix().to_string(),
            source: job.source.clone(),
            platform: job.platform.clone(),
            requested_format: job.requested_format.map(|f| f.to_string()),
            state: job.state,
            error: job.error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            artifact: job.artifact.as_ref().map(|artifact| ArtifactInfo {
                content_type: artifact.content_type().to_string(),
                size_bytes: artifact.len(),
                download_name: artifact.download_name().to_string(),
                readers: artifact.reader_count(),
            }),
        }
    }
}

/// Pagination parameters for list endpoints.
#[derive(Debug, Clone, Deserialize, utoipa::IntoParams)]
pub struct PaginationParams {
    /// Number of items to return (default: 20, max: 100)
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Number of items to skip
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl PaginationParams {
    pub fn clamped_limit(&self) -> usize {
        self.limit.min(100) as usize
    }
}

/// Paginated job listing.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub items: Vec<JobResponse>,
    /// Total number of known jobs
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Request to probe a source for metadata and available formats.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct ProbeRequest {
    /// Source URL to probe
    pub source: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Distinct in-flight jobs (running + queued)
    pub jobs_in_flight: usize,
    /// Currently running jobs
    pub jobs_running: usize,
    /// Jobs known to the registry (including retained terminal jobs)
    pub jobs_known: usize,
    /// Extractor version detected at startup, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor_version: Option<String>,
    /// Transcoder version detected at startup, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoder_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::JobRequest;

    #[test]
    fn test_job_response_from_job() {
        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let job = Job::new(&request);
        let response = JobResponse::from(&job);

        assert_eq!(response.state, JobState::Queued);
        assert_eq!(response.platform, "youtube");
        assert_eq!(response.requested_format.as_deref(), Some("mp4"));
        assert!(response.artifact.is_none());

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"queued\""));
        // Unset optionals are omitted, not null.
        assert!(!json.contains("completed_at"));
    }

    #[test]
    fn test_pagination_clamps_limit() {
        let params = PaginationParams {
            limit: 10_000,
            offset: 0,
        };
        assert_eq!(params.clamped_limit(), 100);
        assert_eq!(PaginationParams::default().limit, 20);
    }
}
