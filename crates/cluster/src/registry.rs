use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use conductor_config::models::ClusterConfig;
use conductor_domain::messaging::{CoordinationQueue, Delivery, Subscription};
use conductor_domain::{handler_fn, queues, Envelope, ServiceInstance, ServiceState, TenantScopedKey};
use conductor_errors::CoordinatorResult;

/// TTL-expiring view over the heartbeats a process has consumed. This is
/// the only way membership is read; instances whose heartbeat lapsed
/// past the TTL are invisible through the accessors.
#[derive(Clone)]
pub struct MembershipView {
    instances: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    liveness_ttl_seconds: i64,
}

impl MembershipView {
    pub fn new(liveness_ttl_seconds: u64) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            liveness_ttl_seconds: liveness_ttl_seconds as i64,
        }
    }

    pub async fn record(&self, instance: ServiceInstance) {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance);
    }

    /// All instances whose heartbeat is within the TTL; expired entries
    /// are pruned on the way through.
    pub async fn alive(&self) -> Vec<ServiceInstance> {
        let now = Utc::now();
        let mut instances = self.instances.write().await;
        instances.retain(|_, inst| !inst.is_expired(self.liveness_ttl_seconds, now));
        instances
            .values()
            .filter(|inst| !inst.state.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn alive_of_kind(
        &self,
        kind: conductor_domain::ServiceKind,
    ) -> Vec<ServiceInstance> {
        self.alive()
            .await
            .into_iter()
            .filter(|inst| inst.kind == kind)
            .collect()
    }

    /// Whether a job with the given worker-group affinity currently has
    /// a live worker that could take it. An ungrouped worker serves
    /// every group, so it satisfies any affinity.
    pub async fn has_live_worker_for(&self, worker_group: Option<&str>) -> bool {
        self.alive_of_kind(conductor_domain::ServiceKind::Worker)
            .await
            .iter()
            .any(|inst| match worker_group {
                Some(group) => {
                    inst.worker_group.is_none() || inst.worker_group.as_deref() == Some(group)
                }
                None => true,
            })
    }
}

/// Owns this process's `ServiceInstance`, publishes its heartbeats and
/// feeds the membership view from everyone else's.
pub struct ServiceRegistry {
    queue: Arc<dyn CoordinationQueue>,
    tenant_id: String,
    instance: Arc<RwLock<ServiceInstance>>,
    view: MembershipView,
    heartbeat_interval: Duration,
}

impl ServiceRegistry {
    pub fn new(
        queue: Arc<dyn CoordinationQueue>,
        tenant_id: impl Into<String>,
        instance: ServiceInstance,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            queue,
            tenant_id: tenant_id.into(),
            instance: Arc::new(RwLock::new(instance)),
            view: MembershipView::new(config.liveness_ttl_seconds),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
        }
    }

    pub fn view(&self) -> MembershipView {
        self.view.clone()
    }

    pub async fn instance_id(&self) -> String {
        self.instance.read().await.id.clone()
    }

    pub async fn instance(&self) -> ServiceInstance {
        self.instance.read().await.clone()
    }

    /// Transitions the owned instance and publishes the new state
    /// immediately rather than waiting for the next interval tick.
    pub async fn set_state(&self, state: ServiceState) -> CoordinatorResult<()> {
        {
            let mut instance = self.instance.write().await;
            if instance.state == state {
                return Ok(());
            }
            info!(id = %instance.id, from = ?instance.state, to = ?state, "service state transition");
            instance.state = state;
        }
        self.publish_heartbeat().await
    }

    /// Emits one heartbeat carrying the current instance snapshot.
    pub async fn publish_heartbeat(&self) -> CoordinatorResult<()> {
        let snapshot = {
            let mut instance = self.instance.write().await;
            instance.last_heartbeat = Utc::now();
            instance.clone()
        };
        let envelope = Envelope::new(TenantScopedKey::new(&self.tenant_id), &snapshot)?;
        self.queue.emit(queues::SERVICE_HEARTBEAT, &envelope).await
    }

    /// Spawns the periodic heartbeat loop. A failed emit is logged and
    /// retried on the next tick.
    pub fn start_heartbeat(self: &Arc<Self>) -> Subscription {
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let registry = Arc::clone(self);
        let interval = registry.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.publish_heartbeat().await {
                            error!(error = %e, "heartbeat emit failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("heartbeat loop stopping");
                            break;
                        }
                    }
                }
            }
        });

        Subscription::new(stop_tx, handle)
    }

    /// Subscribes to everyone's heartbeats under this instance's own id
    /// as consumer group, so each process observes the full broadcast.
    pub async fn start_membership_listener(&self) -> CoordinatorResult<Subscription> {
        let view = self.view.clone();
        let group = self.instance_id().await;
        self.queue
            .subscribe(
                &self.tenant_id,
                queues::SERVICE_HEARTBEAT,
                &group,
                handler_fn(move |delivery: Delivery| {
                    let view = view.clone();
                    async move {
                        match delivery {
                            Ok(envelope) => match envelope.decode::<ServiceInstance>() {
                                Ok(instance) => view.record(instance).await,
                                // commit anyway; an undecodable heartbeat
                                // never gets better on redelivery
                                Err(e) => warn!(error = %e, "dropping undecodable heartbeat"),
                            },
                            Err(malformed) => {
                                warn!(reason = %malformed.reason, "dropping malformed heartbeat");
                            }
                        }
                        Ok(())
                    }
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use conductor_domain::ServiceKind;
    use conductor_infrastructure::InMemoryQueue;

    fn worker_instance(group: Option<&str>) -> ServiceInstance {
        ServiceInstance::new(ServiceKind::Worker, "host-a")
            .with_worker_group(group.map(str::to_string))
    }

    #[tokio::test]
    async fn test_view_expires_stale_instances() {
        let view = MembershipView::new(60);

        let mut stale = worker_instance(None);
        stale.state = ServiceState::Running;
        stale.last_heartbeat = Utc::now() - ChronoDuration::seconds(120);
        let mut fresh = worker_instance(None);
        fresh.state = ServiceState::Running;

        view.record(stale.clone()).await;
        view.record(fresh.clone()).await;

        let alive = view.alive().await;
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_terminal_instances_are_not_alive() {
        let view = MembershipView::new(60);
        let mut gone = worker_instance(None);
        gone.state = ServiceState::TerminatedGracefully;
        view.record(gone).await;
        assert!(view.alive().await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_affinity_liveness() {
        let view = MembershipView::new(60);
        let mut gpu = worker_instance(Some("gpu"));
        gpu.state = ServiceState::Running;
        view.record(gpu).await;

        assert!(view.has_live_worker_for(Some("gpu")).await);
        assert!(!view.has_live_worker_for(Some("docker")).await);
        // grouped worker still counts for ungrouped jobs
        assert!(view.has_live_worker_for(None).await);

        let mut any = worker_instance(None);
        any.state = ServiceState::Running;
        view.record(any).await;
        // ungrouped worker serves every group
        assert!(view.has_live_worker_for(Some("docker")).await);
    }

    #[tokio::test]
    async fn test_heartbeat_feeds_membership_view() {
        let queue: Arc<dyn CoordinationQueue> = Arc::new(InMemoryQueue::new());
        let mut instance = worker_instance(Some("docker"));
        instance.state = ServiceState::Running;
        let config = ClusterConfig {
            heartbeat_interval_seconds: 1,
            liveness_ttl_seconds: 60,
        };
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&queue),
            "main",
            instance.clone(),
            &config,
        ));

        let listener = registry.start_membership_listener().await.unwrap();
        registry.publish_heartbeat().await.unwrap();

        let view = registry.view();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if view.has_live_worker_for(Some("docker")).await {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "heartbeat never reached the view"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        listener.cancel().await;
    }

    #[tokio::test]
    async fn test_undecodable_heartbeat_is_skipped() {
        let queue = Arc::new(InMemoryQueue::new());
        let shared: Arc<dyn CoordinationQueue> = queue.clone();
        let mut instance = worker_instance(Some("docker"));
        instance.state = ServiceState::Running;
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&shared),
            "main",
            instance,
            &ClusterConfig::default(),
        ));

        let listener = registry.start_membership_listener().await.unwrap();
        let group = registry.instance_id().await;

        // well-formed envelope whose payload is not an instance snapshot
        let bogus = Envelope::new(
            TenantScopedKey::new("main"),
            &serde_json::json!({ "not": "an instance" }),
        )
        .unwrap();
        shared.emit(queues::SERVICE_HEARTBEAT, &bogus).await.unwrap();
        registry.publish_heartbeat().await.unwrap();

        let view = registry.view();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            // the bad message is committed and the real one still lands
            if view.has_live_worker_for(Some("docker")).await
                && queue.pending("main", queues::SERVICE_HEARTBEAT, &group).await == 0
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "undecodable heartbeat wedged the listener"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        listener.cancel().await;
    }
}
