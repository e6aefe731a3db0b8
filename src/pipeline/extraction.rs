//! The two-stage extraction pipeline: extract, then optionally transcode.
//!
//! Tool-level failures are translated into the application error taxonomy
//! here; nothing above this layer sees raw exit codes.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Stage;
use crate::pipeline::artifact::ArtifactDescriptor;
use crate::pipeline::job::{JobRegistry, JobRequest, JobState};
use crate::runner::{ToolInvocationResult, ToolRunner, ToolSpec, ToolStatus};
use crate::tools::{extractor, transcoder};
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{Error, Result};

/// Pipeline tuning derived from [`Config`].
pub struct PipelineConfig {
    pub extractor_path: String,
    pub transcoder_path: String,
    /// Hard per-stage timeout. Mandatory: a stage without a timeout is the
    /// primary resource-leak risk.
    pub stage_timeout: Duration,
    /// Serve the raw extracted file when transcoding fails. Explicit opt-in.
    pub transcode_fallback: bool,
    /// Classifies extraction failures as transient (retry-once eligible).
    pub transient: Regex,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            extractor_path: config.extractor_path.clone(),
            transcoder_path: config.transcoder_path.clone(),
            stage_timeout: config.stage_timeout,
            transcode_fallback: config.transcode_fallback,
            transient: Regex::new(&config.transient_pattern)
                .map_err(|e| Error::internal(format!("invalid transient pattern: {}", e)))?,
        })
    }
}

/// Orchestrates one job from workspace allocation to artifact (or failure).
pub struct ExtractionPipeline {
    runner: Arc<dyn ToolRunner>,
    workspaces: Arc<WorkspaceManager>,
    config: PipelineConfig,
}

impl ExtractionPipeline {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        workspaces: Arc<WorkspaceManager>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            runner,
            workspaces,
            config,
        }
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    /// Run the pipeline for one admitted job.
    ///
    /// On success the returned artifact owns the workspace; on any failure
    /// the workspace is released before returning.
    pub async fn run(
        &self,
        job_id: &str,
        request: &JobRequest,
        registry: &JobRegistry,
        cancel: &CancellationToken,
    ) -> Result<Arc<ArtifactDescriptor>> {
        let key = request.key();
        let workspace = self.workspaces.acquire(key.prefix()).await?;

        match self.run_in_workspace(job_id, request, registry, cancel, &workspace).await {
            Ok(artifact_path) => {
                let len = crate::utils::fs::file_size(&artifact_path).await.unwrap_or(0);
                let content_type = transcoder::content_type_for(&artifact_path);
                let host = request.source.host_str().unwrap_or("media").to_string();
                Ok(Arc::new(ArtifactDescriptor::new(
                    artifact_path,
                    content_type,
                    len,
                    &host,
                    workspace,
                )))
            }
            Err(error) => {
                self.release_quietly(&workspace).await;
                Err(error)
            }
        }
    }

    /// Stage sequencing against an already-acquired workspace. Returns the
    /// final artifact path; the caller wraps it into a descriptor or cleans
    /// up on error.
    async fn run_in_workspace(
        &self,
        job_id: &str,
        request: &JobRequest,
        registry: &JobRegistry,
        cancel: &CancellationToken,
        workspace: &Workspace,
    ) -> Result<std::path::PathBuf> {
        registry.set_state(job_id, JobState::Extracting);
        self.run_extract_stage(job_id, request, cancel, workspace).await?;

        let extracted = extractor::locate_output(workspace.path()).await?;
        debug!(job_id, path = %extracted.display(), "Extractor output located");

        let Some(format) = request.format else {
            return Ok(extracted);
        };
        if !transcoder::needs_transcode(&extracted, format) {
            return Ok(extracted);
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        registry.set_state(job_id, JobState::Transcoding);
        match self
            .run_transcode_stage(job_id, &extracted, format, cancel, workspace)
            .await
        {
            Ok(output) => {
                // The extracted intermediate is no longer needed.
                if let Err(e) = tokio::fs::remove_file(&extracted).await {
                    debug!(job_id, error = %e, "Could not remove intermediate file");
                }
                Ok(output)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) if self.config.transcode_fallback => {
                warn!(
                    job_id,
                    error = %error,
                    "Transcode failed, serving raw extracted file (fallback enabled)"
                );
                Ok(extracted)
            }
            Err(error) => Err(error),
        }
    }

    /// Extraction stage with at most one automatic retry on transient
    /// (timeout / network-class) failures.
    async fn run_extract_stage(
        &self,
        job_id: &str,
        request: &JobRequest,
        cancel: &CancellationToken,
        workspace: &Workspace,
    ) -> Result<()> {
        let spec = ToolSpec {
            program: self.config.extractor_path.clone(),
            args: extractor::build_extract_args(&request.source),
            working_dir: workspace.path().to_path_buf(),
            timeout: self.config.stage_timeout,
            capture_full_stdout: false,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.runner.run(&spec, cancel).await?;

            if result.status.is_success() {
                return Ok(());
            }

            if attempt == 1
                && !cancel.is_cancelled()
                && extractor::is_transient_failure(&result, &self.config.transient)
            {
                info!(job_id, "Extraction failed with a transient error, retrying once");
                continue;
            }

            return Err(self.stage_error(Stage::Extracting, &result));
        }
    }

    /// Transcode stage. Deterministic given the same input, so never retried.
    async fn run_transcode_stage(
        &self,
        job_id: &str,
        input: &std::path::Path,
        format: &'static transcoder::OutputFormat,
        cancel: &CancellationToken,
        workspace: &Workspace,
    ) -> Result<std::path::PathBuf> {
        let output = workspace
            .path()
            .join(format!("{}.{}", extractor::OUTPUT_STEM, format.ext));

        let spec = ToolSpec {
            program: self.config.transcoder_path.clone(),
            args: transcoder::build_transcode_args(input, &output, format),
            working_dir: workspace.path().to_path_buf(),
            timeout: self.config.stage_timeout,
            capture_full_stdout: false,
        };

        let result = self.runner.run(&spec, cancel).await?;
        if !result.status.is_success() {
            return Err(self.stage_error(Stage::Transcoding, &result));
        }

        // Treat a zero-length output the same as tool failure; a partial
        // artifact must never be delivered as if complete.
        match crate::utils::fs::file_size(&output).await {
            Some(len) if len > 0 => {
                debug!(job_id, path = %output.display(), len, "Transcode complete");
                Ok(output)
            }
            _ => Err(Error::ToolFailed {
                stage: Stage::Transcoding,
                exit_code: 0,
                detail: "transcoder exited successfully but wrote no output".to_string(),
            }),
        }
    }

    /// Translate a failed tool invocation into the error taxonomy.
    fn stage_error(&self, stage: Stage, result: &ToolInvocationResult) -> Error {
        match result.status {
            ToolStatus::TimedOut => Error::ToolTimeout {
                stage,
                timeout_secs: self.config.stage_timeout.as_secs(),
            },
            ToolStatus::Cancelled => Error::Cancelled,
            ToolStatus::Failed(exit_code) => Error::ToolFailed {
                stage,
                exit_code,
                detail: result
                    .stderr_tail
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no stderr output")
                    .to_string(),
            },
            ToolStatus::Succeeded => Error::internal("stage_error called on a successful result"),
        }
    }

    async fn release_quietly(&self, workspace: &Workspace) {
        if let Err(e) = self.workspaces.release(workspace).await {
            warn!(path = %workspace.path().display(), error = %e, "Failed to release workspace");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::Job;
    use crate::test_utils::{FakeRunner, FakeStep};

    fn pipeline(
        tmp: &std::path::Path,
        script: Vec<FakeStep>,
    ) -> (ExtractionPipeline, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new(script));
        let workspaces = Arc::new(WorkspaceManager::new(tmp, 0));
        let config = PipelineConfig::from_config(&Config::default()).unwrap();
        (
            ExtractionPipeline::new(runner.clone(), workspaces, config),
            runner,
        )
    }

    fn registry_with_job(request: &JobRequest) -> (JobRegistry, String) {
        let registry = JobRegistry::new();
        let job = Job::new(request);
        let id = job.id.clone();
        registry.insert(job);
        (registry, id)
    }

    #[tokio::test]
    async fn test_extract_only_when_format_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![FakeStep::succeed().file("media.mp4", b"vvvv")],
        );
        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let (registry, id) = registry_with_job(&request);

        let artifact = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap();

        // Extracted mp4 + requested mp4: no transcode invocation.
        assert_eq!(runner.invocation_count(), 1);
        assert_eq!(artifact.content_type(), "video/mp4");
        assert_eq!(artifact.len(), 4);
        assert!(artifact.path().exists());
    }

    #[tokio::test]
    async fn test_transcode_runs_when_format_differs() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![
                FakeStep::succeed().file("media.webm", b"wwww"),
                FakeStep::succeed().file("media.mp4", b"vvvvvv"),
            ],
        );
        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let (registry, id) = registry_with_job(&request);

        let artifact = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(runner.invocation_count(), 2);
        assert_eq!(artifact.content_type(), "video/mp4");
        // Intermediate webm removed after a successful transcode.
        assert!(!artifact.path().with_extension("webm").exists());

        let invocations = runner.invocations();
        assert!(invocations[1].args.contains(&"-i".to_string()));
    }

    #[tokio::test]
    async fn test_extract_failure_skips_transcode_and_releases_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![FakeStep::fail(1, "ERROR: Unsupported URL")],
        );
        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let (registry, id) = registry_with_job(&request);

        let error = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::ToolFailed {
                stage: Stage::Extracting,
                exit_code: 1,
                ..
            }
        ));
        assert_eq!(runner.invocation_count(), 1);
        // Workspace directory is gone.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transient_extract_failure_retries_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![
                FakeStep::fail(1, "ERROR: Connection reset by peer"),
                FakeStep::succeed().file("media.mp4", b"vv"),
            ],
        );
        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let (registry, id) = registry_with_job(&request);

        let artifact = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(runner.invocation_count(), 2);
        assert_eq!(artifact.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_retries_once_then_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![FakeStep::timed_out(), FakeStep::timed_out()],
        );
        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let (registry, id) = registry_with_job(&request);

        let error = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(runner.invocation_count(), 2);
        assert!(matches!(
            error,
            Error::ToolTimeout {
                stage: Stage::Extracting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_is_no_output_produced() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(tmp.path(), vec![FakeStep::succeed()]);
        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let (registry, id) = registry_with_job(&request);

        let error = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::NoOutputProduced));
    }

    #[tokio::test]
    async fn test_transcode_failure_is_never_retried_and_fails_hard() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, runner) = pipeline(
            tmp.path(),
            vec![
                FakeStep::succeed().file("media.webm", b"wwww"),
                FakeStep::fail(187, "Conversion failed!"),
            ],
        );
        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let (registry, id) = registry_with_job(&request);

        let error = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(runner.invocation_count(), 2);
        assert!(matches!(
            error,
            Error::ToolFailed {
                stage: Stage::Transcoding,
                exit_code: 187,
                ..
            }
        ));
        assert_eq!(registry.get(&id).unwrap().state, JobState::Transcoding);
    }

    #[tokio::test]
    async fn test_transcode_fallback_serves_extracted_file() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(vec![
            FakeStep::succeed().file("media.webm", b"wwww"),
            FakeStep::fail(1, "Conversion failed!"),
        ]));
        let workspaces = Arc::new(WorkspaceManager::new(tmp.path(), 0));
        let app_config = Config {
            transcode_fallback: true,
            ..Config::default()
        };
        let config = PipelineConfig::from_config(&app_config).unwrap();
        let pipeline = ExtractionPipeline::new(runner.clone(), workspaces, config);

        let request = JobRequest::parse("https://youtu.be/abc", Some("mp4")).unwrap();
        let (registry, id) = registry_with_job(&request);

        let artifact = pipeline
            .run(&id, &request, &registry, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.content_type(), "video/webm");
        assert!(artifact.path().exists());
    }

    #[tokio::test]
    async fn test_cancelled_tool_result_maps_to_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (pipeline, _) = pipeline(
            tmp.path(),
            vec![FakeStep::succeed().delay(std::time::Duration::from_secs(30))],
        );
        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let (registry, id) = registry_with_job(&request);

        let error = pipeline.run(&id, &request, &registry, &cancel).await.unwrap_err();
        assert!(matches!(error, Error::Cancelled));
        // Workspace reclaimed on cancellation too.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
