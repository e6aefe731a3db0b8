//! Test support: a scripted [`ToolRunner`] that never spawns processes.
//!
//! Used by the in-crate unit tests and the scenario tests under `tests/`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::runner::{ToolInvocationResult, ToolRunner, ToolSpec, ToolStatus};

/// One scripted invocation: the result to report, files to drop into the
/// working directory beforehand, and an optional delay to simulate a slow
/// tool (during which cancellation is honored).
#[derive(Debug, Clone)]
pub struct FakeStep {
    pub status: ToolStatus,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<(String, Vec<u8>)>,
    pub delay: Duration,
}

impl FakeStep {
    pub fn succeed() -> Self {
        Self {
            status: ToolStatus::Succeeded,
            stdout: String::new(),
            stderr: String::new(),
            files: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            status: ToolStatus::Failed(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            files: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: ToolStatus::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
            files: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    /// File written into the tool's working directory before it "exits".
    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.files.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Scripted fake runner. Steps are consumed in invocation order; running out
/// of script is a test bug and panics.
pub struct FakeRunner {
    script: Mutex<VecDeque<FakeStep>>,
    invocations: Mutex<Vec<ToolSpec>>,
}

impl FakeRunner {
    pub fn new(script: Vec<FakeStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Endless script: every invocation behaves like `step`.
    pub fn repeating(step: FakeStep) -> Self {
        let mut script = VecDeque::new();
        // More invocations than any test issues.
        for _ in 0..1024 {
            script.push_back(step.clone());
        }
        Self {
            script: Mutex::new(script),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn invocations(&self) -> Vec<ToolSpec> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(
        &self,
        spec: &ToolSpec,
        cancel: &CancellationToken,
    ) -> Result<ToolInvocationResult> {
        let step = {
            let mut script = self.script.lock();
            self.invocations.lock().push(spec.clone());
            script.pop_front().expect("FakeRunner script exhausted")
        };

        if !step.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(ToolInvocationResult {
                        status: ToolStatus::Cancelled,
                        stdout_tail: String::new(),
                        stderr_tail: String::new(),
                        duration: Duration::ZERO,
                    });
                }
                _ = tokio::time::sleep(step.delay) => {}
            }
        }

        for (name, data) in &step.files {
            tokio::fs::write(spec.working_dir.join(name), data)
                .await
                .expect("FakeRunner could not write scripted file");
        }

        Ok(ToolInvocationResult {
            status: step.status,
            stdout_tail: step.stdout.clone(),
            stderr_tail: step.stderr.clone(),
            duration: step.delay,
        })
    }
}
