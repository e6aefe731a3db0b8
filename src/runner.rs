//! External tool execution with timeout, cancellation, and bounded output
//! capture.
//!
//! The pipeline only talks to the [`ToolRunner`] trait so it can be exercised
//! against a fake runner that never spawns real processes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Maximum captured lines per output stream.
const TAIL_MAX_LINES: usize = 64;
/// Maximum captured length of a single output line.
const TAIL_MAX_LINE_LEN: usize = 512;
/// Cap for full stdout capture (metadata probes emit one large JSON line).
const FULL_CAPTURE_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Terminal status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Process exited with code 0.
    Succeeded,
    /// Process exited with a non-zero code.
    Failed(i32),
    /// The wall-clock timeout expired and the process tree was terminated.
    TimedOut,
    /// The cancellation token fired and the process tree was terminated.
    Cancelled,
}

impl ToolStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolStatus::Succeeded)
    }
}

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, already split.
    pub args: Vec<String>,
    /// Working directory; for pipeline stages this is the job workspace.
    pub working_dir: PathBuf,
    /// Hard wall-clock timeout. Every invocation must carry one; unbounded
    /// external-tool hangs are the primary resource-leak risk.
    pub timeout: Duration,
    /// Capture stdout in full (up to a fixed cap) instead of as a bounded
    /// tail. Needed for tools whose stdout IS the result, e.g. JSON probes.
    pub capture_full_stdout: bool,
}

/// Captured result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocationResult {
    pub status: ToolStatus,
    /// Bounded tail of stdout, for diagnostics and JSON probe output.
    pub stdout_tail: String,
    /// Bounded tail of stderr, for diagnostics and failure classification.
    pub stderr_tail: String,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

/// Runs external tools. Implemented by the real process runner and by test
/// fakes.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Execute `spec`, honoring its timeout and the cancellation token.
    ///
    /// Always produces a result (never blocks past timeout + grace period);
    /// returns `Err` only for environment-level failures such as a missing
    /// binary.
    async fn run(&self, spec: &ToolSpec, cancel: &CancellationToken)
    -> Result<ToolInvocationResult>;
}

/// Read a stream line by line, keeping a bounded tail.
fn spawn_tail_reader<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_MAX_LINES);

        while let Ok(Some(mut line)) = lines.next_line().await {
            if line.len() > TAIL_MAX_LINE_LEN {
                let mut cut = TAIL_MAX_LINE_LEN;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                line.truncate(cut);
            }
            if tail.len() == TAIL_MAX_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

/// Read a stream to the end, up to [`FULL_CAPTURE_MAX_BYTES`].
fn spawn_full_reader<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut limited = stream.take(FULL_CAPTURE_MAX_BYTES);
        let _ = limited.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Process-backed [`ToolRunner`].
pub struct ProcessToolRunner {
    /// Grace period between the termination signal and the forced kill.
    kill_grace: Duration,
}

impl ProcessToolRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    fn build_command(spec: &ToolSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Tools may spawn helpers (the transcoder in particular); put the
        // whole tree in its own process group so termination reaches them.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }

        cmd
    }

    /// Terminate the process tree: graceful signal first, forced kill after
    /// the grace period.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // The child leads its own process group (see `build_command`), so
            // group signals reach any helpers it spawned.
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(self.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!(pid, "Process ignored SIGTERM, escalating to SIGKILL");
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(
        &self,
        spec: &ToolSpec,
        cancel: &CancellationToken,
    ) -> Result<ToolInvocationResult> {
        debug!(program = %spec.program, args = ?spec.args, "Spawning tool");

        let started = Instant::now();
        let mut child = Self::build_command(spec)
            .spawn()
            .map_err(|e| Error::io_path("spawning", Path::new(&spec.program), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("Failed to capture tool stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("Failed to capture tool stderr"))?;

        let stdout_task = if spec.capture_full_stdout {
            spawn_full_reader(stdout)
        } else {
            spawn_tail_reader(stdout)
        };
        let stderr_task = spawn_tail_reader(stderr);

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(program = %spec.program, "Cancellation requested, terminating tool");
                self.terminate(&mut child).await;
                ToolStatus::Cancelled
            }
            _ = tokio::time::sleep(spec.timeout) => {
                warn!(program = %spec.program, timeout_secs = spec.timeout.as_secs(), "Tool timed out");
                self.terminate(&mut child).await;
                ToolStatus::TimedOut
            }
            exit = child.wait() => {
                match exit {
                    Ok(exit_status) if exit_status.success() => ToolStatus::Succeeded,
                    Ok(exit_status) => {
                        // A signal death has no exit code; report -1 so the
                        // failure is still representable.
                        let code = exit_status.code().unwrap_or(-1);
                        warn!(program = %spec.program, code, "Tool exited with failure");
                        ToolStatus::Failed(code)
                    }
                    Err(e) => {
                        return Err(Error::internal(format!(
                            "Error waiting for {}: {}",
                            spec.program, e
                        )));
                    }
                }
            }
        };

        let stdout_tail = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        Ok(ToolInvocationResult {
            status,
            stdout_tail,
            stderr_tail,
            duration: started.elapsed(),
        })
    }
}

/// Detect a tool's version for the startup log. Failures are not fatal; the
/// tool may still appear later in the container's PATH.
pub fn detect_version(path: &str, version_arg: &str) -> Option<String> {
    let mut cmd = std::process::Command::new(path);
    cmd.arg(version_arg);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.output().ok().and_then(|output| {
        String::from_utf8(output.stdout)
            .ok()
            .map(|s| s.lines().next().unwrap_or("").trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], timeout: Duration) -> ToolSpec {
        ToolSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            timeout,
            capture_full_stdout: false,
        }
    }

    fn runner() -> ProcessToolRunner {
        ProcessToolRunner::new(Duration::from_secs(1))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_invocation_captures_output() {
        let result = runner()
            .run(
                &spec("sh", &["-c", "echo out; echo err >&2"], Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Succeeded);
        assert_eq!(result.stdout_tail, "out");
        assert_eq!(result.stderr_tail, "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let result = runner()
            .run(
                &spec("sh", &["-c", "exit 3"], Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Failed(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let started = std::time::Instant::now();
        let result = runner()
            .run(
                &spec("sh", &["-c", "sleep 30"], Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner()
            .run(&spec("sh", &["-c", "sleep 30"], Duration::from_secs(60)), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_stdout_capture_is_not_line_capped() {
        let mut spec = spec(
            "sh",
            &["-c", "head -c 2000 /dev/zero | tr '\\0' x"],
            Duration::from_secs(10),
        );
        spec.capture_full_stdout = true;

        let result = runner()
            .run(&spec, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Succeeded);
        assert_eq!(result.stdout_tail.len(), 2000);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let result = runner()
            .run(
                &spec("ripd-no-such-binary", &[], Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tail_reader_keeps_only_recent_lines() {
        let mut data = String::new();
        for i in 0..(TAIL_MAX_LINES + 10) {
            data.push_str(&format!("line-{}\n", i));
        }

        let tail = spawn_tail_reader(std::io::Cursor::new(data.into_bytes()))
            .await
            .unwrap();
        let lines: Vec<&str> = tail.lines().collect();

        assert_eq!(lines.len(), TAIL_MAX_LINES);
        assert_eq!(lines[0], "line-10");
        assert_eq!(lines[TAIL_MAX_LINES - 1], format!("line-{}", TAIL_MAX_LINES + 9));
    }

    #[tokio::test]
    async fn test_tail_reader_truncates_long_lines() {
        let long = "y".repeat(TAIL_MAX_LINE_LEN * 4);
        let tail = spawn_tail_reader(std::io::Cursor::new(long.into_bytes()))
            .await
            .unwrap();
        assert_eq!(tail.len(), TAIL_MAX_LINE_LEN);
    }
}
