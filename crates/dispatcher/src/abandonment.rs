use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use conductor_cluster::MembershipView;
use conductor_config::models::DispatchConfig;
use conductor_domain::messaging::Subscription;
use conductor_errors::CoordinatorResult;

use crate::{DispatchState, JobDispatcher};

/// What to do with an abandoned job on its current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
}

pub trait RetryPolicy: Send + Sync {
    fn decide(&self, attempt: u32) -> RetryDecision;
}

/// Default policy: bounded attempts with exponential backoff and jitter.
pub struct BoundedBackoff {
    max_attempts: u32,
    base: Duration,
}

impl BoundedBackoff {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self { max_attempts, base }
    }
}

impl Default for BoundedBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

impl RetryPolicy for BoundedBackoff {
    fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt + 1 >= self.max_attempts {
            return RetryDecision::Fail;
        }
        let backoff = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = rand::rng().random_range(0..=backoff.as_millis().min(1000) as u64);
        RetryDecision::Retry {
            delay: backoff + Duration::from_millis(jitter_ms),
        }
    }
}

/// Periodically scans sent jobs past the result timeout. A stale job
/// whose worker group has no live member is abandoned and handed to the
/// retry policy: re-emitted with the same correlation id and a bumped
/// attempt, or failed to the execution sink.
pub struct AbandonmentDetector {
    dispatcher: Arc<JobDispatcher>,
    view: MembershipView,
    policy: Arc<dyn RetryPolicy>,
    result_timeout: chrono::Duration,
    detection_interval: Duration,
}

impl AbandonmentDetector {
    pub fn new(
        dispatcher: Arc<JobDispatcher>,
        view: MembershipView,
        policy: Arc<dyn RetryPolicy>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            dispatcher,
            view,
            policy,
            result_timeout: chrono::Duration::seconds(config.result_timeout_seconds as i64),
            detection_interval: Duration::from_secs(config.detection_interval_seconds),
        }
    }

    pub fn start(self: Arc<Self>) -> Subscription {
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let detector = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.detection_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = detector.scan_once().await {
                            error!(error = %e, "abandonment scan failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("abandonment detector stopping");
                            break;
                        }
                    }
                }
            }
        });

        Subscription::new(stop_tx, handle)
    }

    /// One detection pass. Public so tests can drive it without waiting
    /// on the interval.
    pub async fn scan_once(&self) -> CoordinatorResult<()> {
        let stale = self.dispatcher.stale_sent_jobs(self.result_timeout).await;
        for job in stale {
            if self
                .view
                .has_live_worker_for(job.worker_group.as_deref())
                .await
            {
                // worker is alive, the result may still arrive
                continue;
            }
            if self.dispatcher.mark_abandoned(&job.job_id).await.is_err() {
                // resolved between the scan and the mark
                continue;
            }

            match self.policy.decide(job.attempt) {
                RetryDecision::Retry { delay } => {
                    info!(job_id = %job.job_id, attempt = job.attempt,
                        delay_ms = delay.as_millis() as u64, "abandoned job scheduled for retry");
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let retry = job.next_attempt();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // a slow worker's result may have landed during
                        // the backoff; the resolution wins, not the retry
                        if dispatcher.state_of(&retry.job_id).await
                            != Some(DispatchState::Abandoned)
                        {
                            debug!(job_id = %retry.job_id,
                                "job resolved during backoff, retry dropped");
                            return;
                        }
                        if let Err(e) = dispatcher.dispatch(retry).await {
                            error!(error = %e, "retry dispatch failed");
                        }
                    });
                }
                RetryDecision::Fail => {
                    warn!(job_id = %job.job_id, attempt = job.attempt,
                        "abandoned job exhausted its attempts");
                    self.dispatcher
                        .fail_job(&job, "no live worker and retry attempts exhausted")
                        .await?;
                }
            }
        }
        self.dispatcher.prune_resolved().await;
        Ok(())
    }
}
