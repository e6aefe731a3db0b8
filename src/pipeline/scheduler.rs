//! Job admission: bounded concurrency, bounded FIFO queue, deduplication.
//!
//! The slot counter and the dedup key table are the only concurrently
//! mutated shared state in the pipeline. Admission is check-and-increment on
//! an atomic; slot acquisition goes through a semaphore whose waiter queue
//! is FIFO, which is exactly the arrival-order admission the queue needs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::pipeline::dedup::{Deduplicator, ExecutionPublisher, JobExecution, new_execution};
use crate::pipeline::extraction::ExtractionPipeline;
use crate::pipeline::job::{Job, JobRegistry, JobRequest};
use crate::{Error, Result};

/// Scheduler sizing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum simultaneously running jobs (execution slots).
    pub max_concurrent_jobs: usize,
    /// Maximum admitted-but-not-running jobs. Beyond slots + queue, submit
    /// fails immediately with `Overloaded`.
    pub max_queue_depth: usize,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_queue_depth: config.max_queue_depth,
        }
    }

    fn capacity(&self) -> usize {
        self.max_concurrent_jobs + self.max_queue_depth
    }
}

/// Result of a submit call.
pub struct SubmitOutcome {
    pub execution: Arc<JobExecution>,
    /// True when the request attached to an already in-flight execution.
    pub deduplicated: bool,
}

/// Result of a cancel call.
pub enum CancelOutcome {
    /// Cancellation was requested; the job will reach `Cancelled` shortly.
    Requested(Job),
    /// The job had already reached a terminal state.
    AlreadyTerminal(Job),
}

/// Admits, queues, deduplicates, and drives jobs.
pub struct JobScheduler {
    config: SchedulerConfig,
    pipeline: Arc<ExtractionPipeline>,
    registry: Arc<JobRegistry>,
    dedup: Arc<Deduplicator>,
    /// Execution slots; waiters are served in FIFO order.
    slots: Arc<Semaphore>,
    /// Distinct in-flight executions (running + queued). Deduplicated
    /// requests share one entry and therefore one slot.
    in_flight: Arc<AtomicUsize>,
    /// Root token; cancelling it (shutdown) cancels every execution.
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<ExtractionPipeline>,
        shutdown: CancellationToken,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            pipeline,
            registry: Arc::new(JobRegistry::new()),
            dedup: Arc::new(Deduplicator::new()),
            slots,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Distinct in-flight executions (running + queued).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Currently running executions.
    pub fn running(&self) -> usize {
        self.config
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits())
    }

    /// Submit a request: join an identical in-flight job or admit a new one.
    ///
    /// Fails with `Overloaded` when slots and queue are both full; the
    /// rejected request allocates nothing, not even a workspace.
    pub fn submit(&self, request: JobRequest) -> Result<SubmitOutcome> {
        let key = request.key();

        let (execution, created) = self.dedup.join_or_start(&key, || {
            let capacity = self.config.capacity();
            if self
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < capacity).then_some(n + 1)
                })
                .is_err()
            {
                warn!(key = %key, capacity, "Rejecting job, scheduler at capacity");
                return Err(Error::Overloaded);
            }

            let job = Job::new(&request);
            let job_id = job.id.clone();
            self.registry.insert(job);

            let cancel = self.shutdown.child_token();
            let (execution, publisher) = new_execution(job_id, key.clone(), cancel);
            self.spawn_driver(request.clone(), execution.clone(), publisher);
            Ok(execution)
        })?;

        if created {
            info!(job_id = execution.job_id(), key = %key, "Job admitted");
        } else {
            debug!(job_id = execution.job_id(), key = %key, "Request joined in-flight job");
        }

        Ok(SubmitOutcome {
            execution,
            deduplicated: !created,
        })
    }

    /// Drive one execution: wait for a slot, run the pipeline, publish the
    /// terminal result exactly once.
    fn spawn_driver(
        &self,
        request: JobRequest,
        execution: Arc<JobExecution>,
        publisher: ExecutionPublisher,
    ) {
        let slots = self.slots.clone();
        let pipeline = self.pipeline.clone();
        let registry = self.registry.clone();
        let dedup = self.dedup.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let job_id = execution.job_id().to_string();
            let cancel = execution.cancel_token().clone();

            // Queued until a slot frees. Cancellation here removes the job
            // from the queue without it ever running.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = slots.acquire_owned() => permit.ok(),
            };

            let result = match permit {
                None => {
                    debug!(job_id, "Job cancelled before admission");
                    Err(Arc::new(Error::Cancelled))
                }
                Some(_permit) => pipeline
                    .run(&job_id, &request, &registry, &cancel)
                    .await
                    .map_err(Arc::new),
            };

            match &result {
                Ok(artifact) => registry.complete(&job_id, artifact.clone()),
                Err(error) => registry.fail(&job_id, error),
            }

            // Evict before publishing so a request arriving in between
            // starts a fresh execution instead of attaching to a dead one.
            dedup.evict(execution.key());
            in_flight.fetch_sub(1, Ordering::SeqCst);
            publisher.publish(result);
        });
    }

    /// Request cancellation of a job by id.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if job.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job));
        }

        if let Some(execution) = self.dedup.get(&job.key)
            && execution.job_id() == job_id
        {
            execution.cancel();
            info!(job_id, "Job cancellation requested");
        }

        Ok(CancelOutcome::Requested(job))
    }

    /// Execution handle for a job, while it is in flight.
    pub fn execution_for(&self, job_id: &str) -> Option<Arc<JobExecution>> {
        let job = self.registry.get(job_id)?;
        self.dedup
            .get(&job.key)
            .filter(|execution| execution.job_id() == job_id)
    }
}
