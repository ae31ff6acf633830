use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use conductor_domain::messaging::CoordinationQueue;
use conductor_domain::{queues, WorkerJob, WorkerResult};
use conductor_errors::{CoordinatorError, CoordinatorResult};

/// Execution state machine behind the dispatch boundary. The dispatcher
/// only guarantees correlation and exactly-one-application; what a
/// result means for the owning execution lives on the other side of
/// this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn apply_result(&self, result: &WorkerResult) -> CoordinatorResult<()>;
    async fn job_failed(&self, job: &WorkerJob, reason: &str) -> CoordinatorResult<()>;
}

/// Per-job lifecycle as observed on the dispatching side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Created,
    Sent,
    ResultReceived,
    Abandoned,
}

#[derive(Debug, Clone)]
struct TrackedJob {
    job: WorkerJob,
    state: DispatchState,
    sent_at: DateTime<Utc>,
}

/// Tracks every dispatched job until it is resolved and applies each
/// correlated result at most once.
pub struct JobDispatcher {
    queue: Arc<dyn CoordinationQueue>,
    sink: Arc<dyn ExecutionSink>,
    jobs: Arc<RwLock<HashMap<String, TrackedJob>>>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn CoordinationQueue>, sink: Arc<dyn ExecutionSink>) -> Self {
        Self {
            queue,
            sink,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Hands a job to the queue and starts tracking it. A retried job
    /// reuses its id, so a redispatch replaces the abandoned entry; a job
    /// that already resolved is never dispatched again.
    pub async fn dispatch(&self, job: WorkerJob) -> CoordinatorResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            if let Some(tracked) = jobs.get(&job.job_id) {
                if tracked.state == DispatchState::ResultReceived {
                    debug!(job_id = %job.job_id, "job already resolved, dispatch dropped");
                    return Ok(());
                }
            }
            jobs.insert(
                job.job_id.clone(),
                TrackedJob {
                    job: job.clone(),
                    state: DispatchState::Created,
                    sent_at: Utc::now(),
                },
            );
        }

        match self.queue.emit(queues::WORKER_JOB, &job.to_envelope()?).await {
            Ok(()) => {
                let mut jobs = self.jobs.write().await;
                if let Some(tracked) = jobs.get_mut(&job.job_id) {
                    tracked.state = DispatchState::Sent;
                    tracked.sent_at = Utc::now();
                }
                debug!(job_id = %job.job_id, execution_id = %job.execution_id,
                    attempt = job.attempt, group = ?job.worker_group, "job sent");
                Ok(())
            }
            Err(e) => {
                // undelivered; the caller owns the retry decision
                self.jobs.write().await.remove(&job.job_id);
                Err(e)
            }
        }
    }

    /// Correlates a result to its tracked job. A result for an unknown
    /// or already-resolved job is discarded, not reapplied.
    pub async fn apply_result(&self, result: &WorkerResult) -> CoordinatorResult<()> {
        let resolve = {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(result.job_id()) {
                Some(tracked) if tracked.state == DispatchState::ResultReceived => {
                    warn!(job_id = %result.job_id(), "duplicate result for resolved job, discarding");
                    false
                }
                Some(tracked) => {
                    tracked.state = DispatchState::ResultReceived;
                    true
                }
                None => {
                    warn!(job_id = %result.job_id(), "late result for untracked job, discarding");
                    false
                }
            }
        };

        if resolve {
            info!(job_id = %result.job_id(), state = ?result.state(), "result received");
            self.sink.apply_result(result).await?;
        }
        Ok(())
    }

    /// Fails an unresolved job to the execution sink and stops tracking
    /// it.
    pub async fn fail_job(&self, job: &WorkerJob, reason: &str) -> CoordinatorResult<()> {
        warn!(job_id = %job.job_id, reason, "job failed without result");
        self.jobs.write().await.remove(&job.job_id);
        self.sink.job_failed(job, reason).await
    }

    /// Sent jobs older than the given timeout, candidates for
    /// abandonment.
    pub async fn stale_sent_jobs(&self, timeout: Duration) -> Vec<WorkerJob> {
        let cutoff = Utc::now() - timeout;
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|tracked| tracked.state == DispatchState::Sent && tracked.sent_at < cutoff)
            .map(|tracked| tracked.job.clone())
            .collect()
    }

    /// Marks a job abandoned; returns an error if it resolved in the
    /// meantime so the caller does not retry a finished job.
    pub async fn mark_abandoned(&self, job_id: &str) -> CoordinatorResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(tracked) if tracked.state == DispatchState::Sent => {
                tracked.state = DispatchState::Abandoned;
                Ok(())
            }
            Some(tracked) => Err(CoordinatorError::queue(format!(
                "job {job_id} is {:?}, not abandonable",
                tracked.state
            ))),
            None => Err(CoordinatorError::job_not_found(job_id)),
        }
    }

    pub async fn state_of(&self, job_id: &str) -> Option<DispatchState> {
        self.jobs.read().await.get(job_id).map(|tracked| tracked.state)
    }

    /// Drops resolved entries; called periodically so the tracking map
    /// does not grow unbounded. Abandoned entries stay tracked until
    /// their retry redispatches them or they are failed, so a late
    /// result can still correlate in the meantime.
    pub async fn prune_resolved(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, tracked| tracked.state != DispatchState::ResultReceived);
        before - jobs.len()
    }
}
