use std::sync::Arc;

use tracing::{debug, info, warn};

use conductor_domain::messaging::{CoordinationQueue, Delivery, Subscription};
use conductor_domain::{handler_fn, queues, WorkerJob, WorkerResult};
use conductor_errors::{CoordinatorError, CoordinatorResult};

use crate::JobExecutor;

/// Consumes jobs for one `(worker_id, worker_group)` registration and
/// emits a correlated result per job. An execution failure is emitted as
/// a failed result, not redelivered; only a failure to emit the result
/// leaves the job uncommitted for redelivery.
pub struct WorkerService {
    queue: Arc<dyn CoordinationQueue>,
    tenant_id: String,
    worker_id: String,
    worker_group: Option<String>,
    executor: Arc<dyn JobExecutor>,
}

impl WorkerService {
    pub fn builder() -> WorkerServiceBuilder {
        WorkerServiceBuilder::default()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_group(&self) -> Option<&str> {
        self.worker_group.as_deref()
    }

    pub async fn start(&self) -> CoordinatorResult<Subscription> {
        info!(worker_id = %self.worker_id, group = ?self.worker_group, "worker starting");
        let queue = Arc::clone(&self.queue);
        let executor = Arc::clone(&self.executor);
        let worker_id = self.worker_id.clone();

        self.queue
            .subscribe_worker(
                &self.tenant_id,
                &self.worker_id,
                self.worker_group.as_deref(),
                handler_fn(move |delivery: Delivery| {
                    let queue = Arc::clone(&queue);
                    let executor = Arc::clone(&executor);
                    let worker_id = worker_id.clone();
                    async move {
                        let envelope = match delivery {
                            Ok(envelope) => envelope,
                            Err(malformed) => {
                                warn!(worker_id = %worker_id, reason = %malformed.reason,
                                    "dropping malformed job");
                                return Ok(());
                            }
                        };
                        let job = match envelope.decode::<WorkerJob>() {
                            Ok(job) => job,
                            Err(e) => {
                                // commit anyway; redelivery cannot fix it
                                warn!(worker_id = %worker_id, error = %e,
                                    "dropping undecodable job");
                                return Ok(());
                            }
                        };
                        debug!(worker_id = %worker_id, job_id = %job.job_id,
                            attempt = job.attempt, "executing job");

                        let result = match executor.execute(&job).await {
                            Ok(output) => WorkerResult::success(&job, Some(output)),
                            Err(e) => {
                                warn!(job_id = %job.job_id, error = %e, "job execution failed");
                                WorkerResult::failure(&job, e.to_string())
                            }
                        };
                        queue
                            .emit(queues::WORKER_RESULT, &result.to_envelope()?)
                            .await
                    }
                }),
            )
            .await
    }
}

#[derive(Default)]
pub struct WorkerServiceBuilder {
    queue: Option<Arc<dyn CoordinationQueue>>,
    tenant_id: Option<String>,
    worker_id: Option<String>,
    worker_group: Option<String>,
    executor: Option<Arc<dyn JobExecutor>>,
}

impl WorkerServiceBuilder {
    pub fn queue(mut self, queue: Arc<dyn CoordinationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn worker_group(mut self, worker_group: Option<String>) -> Self {
        self.worker_group = worker_group;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> CoordinatorResult<WorkerService> {
        Ok(WorkerService {
            queue: self
                .queue
                .ok_or_else(|| CoordinatorError::config("worker requires a queue"))?,
            tenant_id: self
                .tenant_id
                .ok_or_else(|| CoordinatorError::config("worker requires a tenant id"))?,
            worker_id: self
                .worker_id
                .ok_or_else(|| CoordinatorError::config("worker requires a worker id"))?,
            worker_group: self.worker_group,
            executor: self
                .executor
                .ok_or_else(|| CoordinatorError::config("worker requires an executor"))?,
        })
    }
}
