//! Completed artifact descriptors and reader-count accounting.
//!
//! A workspace may not be reclaimed while its artifact has active readers;
//! the count is tracked here and consulted by the retention sweeper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use crate::utils::filename::sanitize_filename;
use crate::workspace::Workspace;

/// Descriptor of the final media file produced by a completed job.
///
/// Owns the job's workspace: the file lives inside it, and releasing the
/// workspace is what reclaims the artifact.
#[derive(Debug)]
pub struct ArtifactDescriptor {
    path: PathBuf,
    content_type: &'static str,
    len: u64,
    download_name: String,
    workspace: Workspace,
    readers: AtomicUsize,
    completed_at: DateTime<Utc>,
}

impl ArtifactDescriptor {
    pub fn new(
        path: PathBuf,
        content_type: &'static str,
        len: u64,
        source_host: &str,
        workspace: Workspace,
    ) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let download_name = format!("{}.{}", sanitize_filename(source_host), ext);

        Self {
            path,
            content_type,
            len,
            download_name,
            workspace,
            readers: AtomicUsize::new(0),
            completed_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Total byte length of the artifact file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Suggested download filename for `Content-Disposition`.
    pub fn download_name(&self) -> &str {
        &self.download_name
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Register a reader. The returned guard decrements the count when
    /// dropped, which covers both normal completion and client disconnects
    /// (the response body is dropped either way).
    pub fn open_reader(self: &Arc<Self>) -> ArtifactReadGuard {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ArtifactReadGuard {
            artifact: Arc::clone(self),
        }
    }
}

/// RAII guard for one active artifact reader.
#[derive(Debug)]
pub struct ArtifactReadGuard {
    artifact: Arc<ArtifactDescriptor>,
}

impl ArtifactReadGuard {
    pub fn artifact(&self) -> &Arc<ArtifactDescriptor> {
        &self.artifact
    }
}

impl Drop for ArtifactReadGuard {
    fn drop(&mut self) {
        self.artifact.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;

    async fn artifact() -> (tempfile::TempDir, Arc<ArtifactDescriptor>) {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path(), 0);
        let ws = mgr.acquire("key").await.unwrap();
        let path = ws.path().join("media.mp4");
        tokio::fs::write(&path, b"data").await.unwrap();
        (
            tmp,
            Arc::new(ArtifactDescriptor::new(
                path,
                "video/mp4",
                4,
                "youtube.com",
                ws,
            )),
        )
    }

    #[tokio::test]
    async fn test_reader_count_tracks_guards() {
        let (_tmp, artifact) = artifact().await;
        assert_eq!(artifact.reader_count(), 0);

        let a = artifact.open_reader();
        let b = artifact.open_reader();
        assert_eq!(artifact.reader_count(), 2);

        drop(a);
        assert_eq!(artifact.reader_count(), 1);
        drop(b);
        assert_eq!(artifact.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_download_name_is_sanitized() {
        let (_tmp, artifact) = artifact().await;
        assert_eq!(artifact.download_name(), "youtube.com.mp4");
        assert!(!artifact.is_empty());
    }
}
