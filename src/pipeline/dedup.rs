//! Request deduplication: one execution, many subscribers.
//!
//! A `JobExecution` is a shared, write-once result cell. The first request
//! for a key starts the execution; everyone else subscribes to its terminal
//! result. The key table is the only shared mutable state here and the
//! check-and-register is atomic via the map's entry API, so a burst of
//! identical requests can never start duplicate executions.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::pipeline::artifact::ArtifactDescriptor;
use crate::pipeline::job::JobKey;
use crate::{Error, Result};

/// Terminal outcome of an execution, cloneable so it can fan out to every
/// subscriber.
pub type TerminalResult = std::result::Result<Arc<ArtifactDescriptor>, Arc<Error>>;

/// Handle to one (possibly shared) in-flight execution.
#[derive(Debug)]
pub struct JobExecution {
    job_id: String,
    key: JobKey,
    result_rx: watch::Receiver<Option<TerminalResult>>,
    cancel: CancellationToken,
}

impl JobExecution {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Cancellation token propagated into the pipeline run.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of this execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal result. Every subscriber observes the same
    /// outcome, no matter when it subscribed.
    pub async fn wait(&self) -> TerminalResult {
        let mut rx = self.result_rx.clone();
        match rx.wait_for(|result| result.is_some()).await {
            Ok(value) => value.clone().expect("guarded by wait_for"),
            // The publisher is dropped only after sending; this is a bug
            // guard, not an expected path.
            Err(_) => Err(Arc::new(Error::internal(
                "job execution terminated without publishing a result",
            ))),
        }
    }

    /// Peek at the terminal result without waiting.
    pub fn result(&self) -> Option<TerminalResult> {
        self.result_rx.borrow().clone()
    }
}

/// Write side of an execution, held by the driver task.
pub struct ExecutionPublisher {
    result_tx: watch::Sender<Option<TerminalResult>>,
}

impl ExecutionPublisher {
    /// Publish the terminal result, waking all subscribers.
    pub fn publish(&self, result: TerminalResult) {
        let _ = self.result_tx.send(Some(result));
    }
}

/// Create an execution/publisher pair.
pub fn new_execution(
    job_id: String,
    key: JobKey,
    cancel: CancellationToken,
) -> (Arc<JobExecution>, ExecutionPublisher) {
    let (result_tx, result_rx) = watch::channel(None);
    (
        Arc::new(JobExecution {
            job_id,
            key,
            result_rx,
            cancel,
        }),
        ExecutionPublisher { result_tx },
    )
}

/// At-most-one in-flight execution per job key.
#[derive(Default)]
pub struct Deduplicator {
    inflight: DashMap<JobKey, Arc<JobExecution>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight execution for `key`, or start one via `start`.
    ///
    /// Returns the execution and whether this call created it. `start` runs
    /// at most once per key while the entry lock is held; keep it cheap (it
    /// should only construct the handle and spawn the driver).
    pub fn join_or_start<F>(&self, key: &JobKey, start: F) -> Result<(Arc<JobExecution>, bool)>
    where
        F: FnOnce() -> Result<Arc<JobExecution>>,
    {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let execution = start()?;
                entry.insert(execution.clone());
                Ok((execution, true))
            }
        }
    }

    /// The in-flight execution for `key`, if any.
    pub fn get(&self, key: &JobKey) -> Option<Arc<JobExecution>> {
        self.inflight.get(key).map(|e| e.clone())
    }

    /// Evict a key once its execution reached a terminal state. Later
    /// requests with the same key start a fresh execution.
    pub fn evict(&self, key: &JobKey) {
        self.inflight.remove(key);
    }

    /// Number of in-flight executions.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::JobRequest;

    fn key() -> JobKey {
        JobRequest::parse("https://youtu.be/abc", None).unwrap().key()
    }

    fn execution(id: &str) -> (Arc<JobExecution>, ExecutionPublisher) {
        new_execution(id.to_string(), key(), CancellationToken::new())
    }

    #[test]
    fn test_join_or_start_starts_once() {
        let dedup = Deduplicator::new();
        let key = key();

        let (first, created) = dedup
            .join_or_start(&key, || Ok(execution("job-1").0))
            .unwrap();
        assert!(created);

        let (second, created) = dedup
            .join_or_start(&key, || panic!("must not start a second execution"))
            .unwrap();
        assert!(!created);
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_evicted_key_starts_fresh() {
        let dedup = Deduplicator::new();
        let key = key();

        dedup
            .join_or_start(&key, || Ok(execution("job-1").0))
            .unwrap();
        dedup.evict(&key);

        let (fresh, created) = dedup
            .join_or_start(&key, || Ok(execution("job-2").0))
            .unwrap();
        assert!(created);
        assert_eq!(fresh.job_id(), "job-2");
    }

    #[test]
    fn test_failed_start_registers_nothing() {
        let dedup = Deduplicator::new();
        let key = key();

        let result = dedup.join_or_start(&key, || Err(Error::Overloaded));
        assert!(matches!(result, Err(Error::Overloaded)));
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_all_subscribers_observe_same_result() {
        let (execution, publisher) = execution("job-1");

        let early = {
            let execution = execution.clone();
            tokio::spawn(async move { execution.wait().await })
        };

        publisher.publish(Err(Arc::new(Error::Cancelled)));

        // Late subscriber, after the result was published.
        let late = execution.wait().await;

        assert!(matches!(early.await.unwrap(), Err(e) if matches!(*e, Error::Cancelled)));
        assert!(matches!(late, Err(e) if matches!(*e, Error::Cancelled)));
    }
}
