//! Per-job scratch workspace allocation and reclamation.
//!
//! Every job owns exactly one workspace directory for the lifetime of its
//! pipeline run; reclamation is deferred until the artifact has no active
//! readers (see `pipeline::retention`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::utils::fs;
use crate::{Error, Result};

/// An exclusively-owned scratch directory bound to one job.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: AtomicBool,
}

impl Workspace {
    /// Path of the workspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `release` has already run for this workspace.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Disk space monitor backed by `sysinfo`.
///
/// Finds the disk with the longest mount-point prefix of the workspace root
/// and reports its available space.
#[derive(Debug, Default)]
struct DiskMonitor {
    disks: Disks,
}

impl DiskMonitor {
    fn new() -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
        }
    }

    fn available_space_for_path(&mut self, path: &Path) -> Option<u64> {
        self.disks.refresh(true);

        let path_str = path.to_string_lossy();
        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

        for disk in self.disks.list() {
            let mount_point = disk.mount_point().to_string_lossy();
            if path_str.starts_with(mount_point.as_ref()) {
                let mount_len = mount_point.len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }

        best_match.map(|(disk, _)| disk.available_space())
    }
}

/// Allocates and reclaims per-job workspace directories.
pub struct WorkspaceManager {
    root: PathBuf,
    min_free_bytes: u64,
    counter: AtomicU64,
    monitor: parking_lot::Mutex<DiskMonitor>,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`. The root directory is created lazily
    /// on first `acquire`.
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            counter: AtomicU64::new(0),
            monitor: parking_lot::Mutex::new(DiskMonitor::new()),
        }
    }

    /// Base path under which workspaces are created.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh workspace for a job.
    ///
    /// Names combine the job key prefix with a monotonic counter, so
    /// concurrent `acquire` calls never collide even for re-runs of the same
    /// key. Fails with `ResourceExhausted` when available disk space on the
    /// root's filesystem is below the configured threshold.
    pub async fn acquire(&self, key_prefix: &str) -> Result<Workspace> {
        fs::ensure_dir_all_with_op("creating workspace root", &self.root).await?;

        if self.min_free_bytes > 0 {
            let available = self.monitor.lock().available_space_for_path(&self.root);
            match available {
                Some(bytes) if bytes < self.min_free_bytes => {
                    warn!(
                        available_bytes = bytes,
                        min_free_bytes = self.min_free_bytes,
                        "Refusing workspace allocation, low disk space"
                    );
                    return Err(Error::resource_exhausted(format!(
                        "low disk space: {} bytes available, {} required",
                        bytes, self.min_free_bytes
                    )));
                }
                Some(_) => {}
                None => {
                    // Unknown filesystems (e.g. tmpfs in containers) are not
                    // grounds for rejecting work.
                    debug!(root = %self.root.display(), "Could not determine disk space");
                }
            }
        }

        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", key_prefix, seq);
        let path = self.root.join(name);

        fs::ensure_dir_all_with_op("creating workspace", &path).await?;
        debug!(path = %path.display(), "Workspace acquired");

        Ok(Workspace {
            path,
            released: AtomicBool::new(false),
        })
    }

    /// Recursively remove a workspace directory.
    ///
    /// Idempotent: the second and later calls are no-ops. Callers must ensure
    /// the artifact reader count is zero first; this never blocks on readers.
    pub async fn release(&self, workspace: &Workspace) -> Result<()> {
        if workspace.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => {
                debug!(path = %workspace.path.display(), "Workspace released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path("removing workspace", &workspace.path, e)),
        }
    }
}

/// Shared handle type used across the pipeline.
pub type SharedWorkspaceManager = Arc<WorkspaceManager>;
