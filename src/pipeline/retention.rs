//! Retention sweeper: reclaims workspaces and evicts terminal job records.
//!
//! A completed artifact is kept for the retention window so poll-mode
//! callers can fetch it. After the window it is reclaimed as soon as its
//! reader count reaches zero; readers that outlive a second full window are
//! forcibly cut off so a stuck client cannot pin disk space forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::job::JobRegistry;
use crate::workspace::WorkspaceManager;

/// Periodic sweeper over the job registry.
pub struct RetentionSweeper {
    registry: Arc<JobRegistry>,
    workspaces: Arc<WorkspaceManager>,
    retention: Duration,
    sweep_interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        registry: Arc<JobRegistry>,
        workspaces: Arc<WorkspaceManager>,
        retention: Duration,
    ) -> Self {
        // Sweep a few times per window, but not busily for short windows.
        let sweep_interval = (retention / 4).clamp(Duration::from_secs(5), Duration::from_secs(300));
        Self {
            registry,
            workspaces,
            retention,
            sweep_interval,
        }
    }

    /// Spawn the background sweep loop.
    pub fn start(self: Arc<Self>, cancel_token: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Retention sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        });
    }

    /// One sweep pass. Separate from the loop so tests can drive it.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| {
            // Absurdly large configured retention; cap to something sane.
            chrono::Duration::days(365)
        });

        let mut reclaimed = 0usize;
        for job in self.registry.snapshot() {
            if !job.state.is_terminal() {
                continue;
            }
            let Some(completed_at) = job.completed_at else {
                continue;
            };
            let age = now - completed_at;
            if age < retention {
                continue;
            }

            match &job.artifact {
                Some(artifact) => {
                    let readers = artifact.reader_count();
                    if readers > 0 && age < retention * 2 {
                        // Within the grace extension; leave it for stragglers.
                        debug!(job_id = %job.id, readers, "Artifact expired but still being read");
                        continue;
                    }
                    if readers > 0 {
                        warn!(
                            job_id = %job.id,
                            readers,
                            "Forcibly reclaiming artifact with active readers after extended retention"
                        );
                    }
                    if let Err(e) = self.workspaces.release(artifact.workspace()).await {
                        warn!(job_id = %job.id, error = %e, "Failed to release workspace");
                        continue;
                    }
                }
                // Failed/cancelled jobs released their workspace at failure
                // time; only the registry record remains.
                None => {}
            }

            self.registry.remove(&job.id);
            reclaimed += 1;
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "Retention sweep reclaimed terminal jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifact::ArtifactDescriptor;
    use crate::pipeline::job::{Job, JobRequest, JobState};
    use crate::{Error, error::Stage};

    async fn completed_job(
        registry: &JobRegistry,
        workspaces: &Arc<WorkspaceManager>,
    ) -> (String, Arc<ArtifactDescriptor>) {
        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let job = Job::new(&request);
        let id = job.id.clone();
        registry.insert(job);

        let ws = workspaces.acquire("key").await.unwrap();
        let path = ws.path().join("media.mp4");
        tokio::fs::write(&path, b"data").await.unwrap();
        let artifact = Arc::new(ArtifactDescriptor::new(path, "video/mp4", 4, "host", ws));

        registry.set_state(&id, JobState::Extracting);
        registry.complete(&id, artifact.clone());
        (id, artifact)
    }

    fn sweeper(
        registry: &Arc<JobRegistry>,
        workspaces: &Arc<WorkspaceManager>,
        retention: Duration,
    ) -> RetentionSweeper {
        RetentionSweeper::new(registry.clone(), workspaces.clone(), retention)
    }

    #[tokio::test]
    async fn test_fresh_artifacts_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let workspaces = Arc::new(WorkspaceManager::new(tmp.path(), 0));
        let (id, artifact) = completed_job(&registry, &workspaces).await;

        sweeper(&registry, &workspaces, Duration::from_secs(3600))
            .sweep()
            .await;

        assert!(registry.get(&id).is_some());
        assert!(artifact.path().exists());
    }

    #[tokio::test]
    async fn test_expired_artifact_without_readers_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let workspaces = Arc::new(WorkspaceManager::new(tmp.path(), 0));
        let (id, artifact) = completed_job(&registry, &workspaces).await;

        // Zero retention: expired immediately.
        sweeper(&registry, &workspaces, Duration::ZERO).sweep().await;

        assert!(registry.get(&id).is_none());
        assert!(!artifact.path().exists());
        assert!(artifact.workspace().is_released());
    }

    #[tokio::test]
    async fn test_active_reader_defers_reclamation_within_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let workspaces = Arc::new(WorkspaceManager::new(tmp.path(), 0));
        let (id, artifact) = completed_job(&registry, &workspaces).await;

        let guard = artifact.open_reader();

        // Age lands between the retention window and its 2x extension.
        let sweeper = sweeper(&registry, &workspaces, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(250)).await;
        sweeper.sweep().await;

        // Expired but still read: kept.
        assert!(registry.get(&id).is_some());
        assert!(artifact.path().exists());

        drop(guard);
        sweeper.sweep().await;

        // Reader gone: reclaimed.
        assert!(registry.get(&id).is_none());
        assert!(!artifact.path().exists());
    }

    #[tokio::test]
    async fn test_failed_job_record_is_evicted_after_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let workspaces = Arc::new(WorkspaceManager::new(tmp.path(), 0));

        let request = JobRequest::parse("https://youtu.be/abc", None).unwrap();
        let job = Job::new(&request);
        let id = job.id.clone();
        registry.insert(job);
        registry.fail(
            &id,
            &Error::ToolFailed {
                stage: Stage::Extracting,
                exit_code: 1,
                detail: "x".into(),
            },
        );

        sweeper(&registry, &workspaces, Duration::ZERO).sweep().await;
        assert!(registry.get(&id).is_none());
    }
}
