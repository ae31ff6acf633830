use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use conductor_cluster::{MaintenanceCoordinator, ServiceRegistry};
use conductor_config::models::AppConfig;
use conductor_dispatcher::{
    AbandonmentDetector, BoundedBackoff, ExecutionSink, JobDispatcher, ResultListener,
};
use conductor_domain::messaging::{CoordinationQueue, Subscription};
use conductor_domain::{
    ServiceInstance, ServiceKind, ServiceState, SingleTenantResolver, TenantResolver, WorkerJob,
    WorkerResult,
};
use conductor_errors::CoordinatorResult;
use conductor_infrastructure::QueueFactory;
use conductor_worker::{InlineExecutor, WorkerService};

/// Which services this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// Dispatch side only: result correlation and abandonment detection.
    Dispatcher,
    /// Worker side only: consume jobs, emit results.
    Worker,
    /// Everything in one process over a shared queue.
    Standalone,
}

/// Execution-state-machine boundary for the binary: results and
/// terminal failures are logged. A full deployment replaces this with
/// the executor's own sink.
struct LoggingExecutionSink;

#[async_trait]
impl ExecutionSink for LoggingExecutionSink {
    async fn apply_result(&self, result: &WorkerResult) -> CoordinatorResult<()> {
        info!(job_id = %result.job_id(), execution_id = %result.execution_id(),
            state = ?result.state(), "execution advanced by worker result");
        Ok(())
    }

    async fn job_failed(&self, job: &WorkerJob, reason: &str) -> CoordinatorResult<()> {
        error!(job_id = %job.job_id, execution_id = %job.execution_id, reason,
            "execution failed without worker result");
        Ok(())
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
    requested_tenant: Option<String>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode, requested_tenant: Option<String>) -> Self {
        Self {
            config,
            mode,
            requested_tenant,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(mode = ?self.mode, backend = self.config.queue.backend_str(), "starting services");

        // reject a non-canonical tenant before any queue operation
        let tenant_id = SingleTenantResolver.resolve(self.requested_tenant.as_deref())?;
        let queue = QueueFactory::create(&self.config).await?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let kind = match self.mode {
            AppMode::Dispatcher => ServiceKind::Executor,
            AppMode::Worker => ServiceKind::Worker,
            AppMode::Standalone => ServiceKind::Executor,
        };
        let worker_group = self.config.worker.worker_group.clone();
        let instance = ServiceInstance::new(kind, hostname)
            .with_worker_group(if kind == ServiceKind::Worker {
                worker_group.clone()
            } else {
                None
            });

        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&queue),
            &tenant_id,
            instance,
            &self.config.cluster,
        ));
        let maintenance = MaintenanceCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            &tenant_id,
        );

        let mut subscriptions: Vec<Subscription> = Vec::new();
        subscriptions.push(registry.start_membership_listener().await?);
        subscriptions.push(maintenance.start().await?);
        subscriptions.push(registry.start_heartbeat());
        registry.set_state(ServiceState::Running).await?;

        if matches!(self.mode, AppMode::Dispatcher | AppMode::Standalone) {
            let dispatcher = Arc::new(JobDispatcher::new(
                Arc::clone(&queue),
                Arc::new(LoggingExecutionSink),
            ));
            subscriptions
                .push(ResultListener::start(Arc::clone(&queue), &tenant_id, Arc::clone(&dispatcher)).await?);

            let detector = Arc::new(AbandonmentDetector::new(
                dispatcher,
                registry.view(),
                Arc::new(BoundedBackoff::new(
                    self.config.dispatch.max_attempts,
                    std::time::Duration::from_secs(self.config.dispatch.backoff_base_seconds),
                )),
                &self.config.dispatch,
            ));
            subscriptions.push(detector.start());
            info!("dispatch services running");
        }

        if matches!(self.mode, AppMode::Worker | AppMode::Standalone) {
            let worker = WorkerService::builder()
                .queue(Arc::clone(&queue))
                .tenant_id(&tenant_id)
                .worker_id(&self.config.worker.worker_id)
                .worker_group(worker_group)
                .executor(Arc::new(InlineExecutor))
                .build()?;
            subscriptions.push(worker.start().await?);
            info!(worker_id = %self.config.worker.worker_id, "worker service running");
        }

        let _ = shutdown_rx.recv().await;
        info!("draining subscriptions");

        self.drain(queue, registry, subscriptions).await;
        Ok(())
    }

    /// Maintenance-style draining: stop accepting new work, let in-flight
    /// handlers finish, then report the terminal state.
    async fn drain(
        &self,
        queue: Arc<dyn CoordinationQueue>,
        registry: Arc<ServiceRegistry>,
        subscriptions: Vec<Subscription>,
    ) {
        queue.pause();
        if let Err(e) = registry.set_state(ServiceState::Terminating).await {
            warn!(error = %e, "could not report terminating state");
        }

        for subscription in subscriptions {
            subscription.cancel().await;
        }

        if let Err(e) = registry.set_state(ServiceState::TerminatedGracefully).await {
            warn!(error = %e, "could not report terminated state");
        }
        info!("all subscriptions stopped");
    }
}
