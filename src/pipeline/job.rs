//! Job identity, state, and the in-memory job registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

use crate::error::Stage;
use crate::pipeline::artifact::ArtifactDescriptor;
use crate::tools::{extractor, transcoder, transcoder::OutputFormat};
use crate::{Error, Result};

/// Deterministic fingerprint of a request: normalized source + output format.
///
/// Two requests with equal keys share one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey(String);

impl JobKey {
    /// Number of key characters used for workspace directory names.
    const PREFIX_LEN: usize = 12;

    pub fn derive(source: &Url, format: Option<&OutputFormat>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(format.map(|f| f.ext).unwrap_or("-").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix, unique enough for log lines and directory names (the
    /// workspace manager adds a monotonic counter on top).
    pub fn prefix(&self) -> &str {
        &self.0[..Self::PREFIX_LEN]
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A validated extraction request. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Normalized source URL.
    pub source: Url,
    /// Requested output format, if any. `None` means "whatever the extractor
    /// produces".
    pub format: Option<&'static OutputFormat>,
}

impl JobRequest {
    /// Validate raw caller input into a request.
    pub fn parse(source: &str, format: Option<&str>) -> Result<Self> {
        let source = extractor::normalize_source(source)?;
        let format = match format.map(str::trim).filter(|f| !f.is_empty()) {
            Some(hint) => Some(transcoder::parse_format(hint)?),
            None => None,
        };
        Ok(Self { source, format })
    }

    pub fn key(&self) -> JobKey {
        JobKey::derive(&self.source, self.format)
    }
}

/// Lifecycle state of a job. Exactly one terminal state is reached and no
/// state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Extracting,
    Transcoding,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Failure details recorded on a job.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobErrorInfo {
    /// Machine-readable kind (`TOOL_FAILED`, `TOOL_TIMEOUT`, ...).
    pub kind: String,
    /// Stage the failure occurred in, when attributable to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

impl JobErrorInfo {
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            stage: error.stage(),
            message: error.to_string(),
        }
    }
}

/// A job known to the registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub key: JobKey,
    pub source: String,
    /// Recognized platform, or "unknown".
    pub platform: String,
    pub requested_format: Option<&'static str>,
    pub state: JobState,
    pub error: Option<JobErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the job completes.
    pub artifact: Option<Arc<ArtifactDescriptor>>,
}

impl Job {
    pub fn new(request: &JobRequest) -> Self {
        let source = request.source.to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: request.key(),
            platform: extractor::detect_platform(&source)
                .unwrap_or("unknown")
                .to_string(),
            source,
            requested_format: request.format.map(|f| f.ext),
            state: JobState::Queued,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            artifact: None,
        }
    }
}

/// In-memory registry of all known jobs.
///
/// The registry is the single source of truth for `GET /api/jobs`; entries
/// for terminal jobs are evicted by the retention sweeper, so it stays
/// bounded without persistence.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Advance a job to a non-terminal state.
    pub fn set_state(&self, id: &str, state: JobState) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            debug_assert!(!job.state.is_terminal(), "terminal states are final");
            if job.started_at.is_none() && state != JobState::Queued {
                job.started_at = Some(Utc::now());
            }
            job.state = state;
        }
    }

    /// Record successful completion.
    pub fn complete(&self, id: &str, artifact: Arc<ArtifactDescriptor>) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            job.state = JobState::Completed;
            job.completed_at = Some(Utc::now());
            job.artifact = Some(artifact);
        }
    }

    /// Record a terminal failure (or cancellation).
    pub fn fail(&self, id: &str, error: &Error) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            job.state = if matches!(error, Error::Cancelled) {
                JobState::Cancelled
            } else {
                JobState::Failed
            };
            job.completed_at = Some(Utc::now());
            job.error = Some(JobErrorInfo::from_error(error));
        }
    }

    pub fn remove(&self, id: &str) -> Option<Job> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    /// Snapshot of all jobs, newest first.
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
