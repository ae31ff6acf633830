use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use conductor_domain::messaging::{CoordinationQueue, Delivery, Subscription};
use conductor_domain::{handler_fn, queues, ClusterEvent, ClusterEventKind, ServiceState};
use conductor_errors::CoordinatorResult;

use crate::ServiceRegistry;

/// Applies maintenance enter/exit broadcasts to this process.
///
/// Entering pauses the shared queue so data-plane subscriptions drain
/// after their in-flight work, and reports the instance as terminating.
/// Exiting resumes delivery. Events are deduplicated by `uid`; delivery
/// is at-least-once so a replayed event must be a no-op.
pub struct MaintenanceCoordinator {
    queue: Arc<dyn CoordinationQueue>,
    registry: Arc<ServiceRegistry>,
    tenant_id: String,
    seen: Arc<Mutex<HashSet<String>>>,
    applied: Arc<AtomicUsize>,
}

impl MaintenanceCoordinator {
    pub fn new(
        queue: Arc<dyn CoordinationQueue>,
        registry: Arc<ServiceRegistry>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            registry,
            tenant_id: tenant_id.into(),
            seen: Arc::new(Mutex::new(HashSet::new())),
            applied: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Operator entry point: broadcast maintenance start to the cluster.
    pub async fn broadcast_enter(&self, message: impl Into<String>) -> CoordinatorResult<()> {
        let event = ClusterEvent::maintenance_enter(message);
        self.broadcast(&event).await
    }

    /// Operator entry point: broadcast maintenance end.
    pub async fn broadcast_exit(&self, message: impl Into<String>) -> CoordinatorResult<()> {
        let event = ClusterEvent::maintenance_exit(message);
        self.broadcast(&event).await
    }

    async fn broadcast(&self, event: &ClusterEvent) -> CoordinatorResult<()> {
        info!(uid = %event.uid, kind = ?event.kind, "broadcasting cluster event");
        self.queue
            .emit(queues::CLUSTER_EVENT, &event.to_envelope(&self.tenant_id)?)
            .await
    }

    /// Count of maintenance transitions actually applied (duplicates
    /// excluded). Observability hook.
    pub fn applied_transitions(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Subscribes to the cluster event queue under this instance's own
    /// id, so every process observes every broadcast.
    pub async fn start(&self) -> CoordinatorResult<Subscription> {
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let seen = Arc::clone(&self.seen);
        let applied = Arc::clone(&self.applied);
        let group = self.registry.instance_id().await;

        self.queue
            .subscribe(
                &self.tenant_id,
                queues::CLUSTER_EVENT,
                &group,
                handler_fn(move |delivery: Delivery| {
                    let queue = Arc::clone(&queue);
                    let registry = Arc::clone(&registry);
                    let seen = Arc::clone(&seen);
                    let applied = Arc::clone(&applied);
                    async move {
                        let envelope = match delivery {
                            Ok(envelope) => envelope,
                            Err(malformed) => {
                                warn!(reason = %malformed.reason, "dropping malformed cluster event");
                                return Ok(());
                            }
                        };
                        let event = match envelope.decode::<ClusterEvent>() {
                            Ok(event) => event,
                            Err(e) => {
                                // commit anyway; redelivery cannot fix it
                                warn!(error = %e, "dropping undecodable cluster event");
                                return Ok(());
                            }
                        };

                        if !seen.lock().await.insert(event.uid.clone()) {
                            debug!(uid = %event.uid, "cluster event already applied, ignoring");
                            return Ok(());
                        }

                        match event.kind {
                            ClusterEventKind::MaintenanceEnter => {
                                info!(uid = %event.uid, message = %event.message,
                                    "entering maintenance, draining delivery");
                                queue.pause();
                                registry.set_state(ServiceState::Terminating).await?;
                            }
                            ClusterEventKind::MaintenanceExit => {
                                info!(uid = %event.uid, message = %event.message,
                                    "leaving maintenance, resuming delivery");
                                queue.resume();
                                registry.set_state(ServiceState::Running).await?;
                            }
                        }
                        applied.fetch_add(1, Ordering::SeqCst);
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
    use conductor_config::models::ClusterConfig;
    use conductor_domain::{Envelope, ServiceInstance, ServiceKind, TenantScopedKey};
    use conductor_infrastructure::InMemoryQueue;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<InMemoryQueue>, Arc<ServiceRegistry>, MaintenanceCoordinator) {
        let queue = Arc::new(InMemoryQueue::new());
        let shared: Arc<dyn CoordinationQueue> = queue.clone();
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&shared),
            "main",
            ServiceInstance::new(ServiceKind::Executor, "host-a"),
            &ClusterConfig::default(),
        ));
        let coordinator =
            MaintenanceCoordinator::new(Arc::clone(&shared), Arc::clone(&registry), "main");
        (queue, registry, coordinator)
    }

    async fn wait_for(coordinator: &MaintenanceCoordinator, transitions: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while coordinator.applied_transitions() < transitions {
            assert!(
                tokio::time::Instant::now() < deadline,
                "maintenance transition never applied"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_enter_pauses_and_reports_terminating() {
        let (queue, registry, coordinator) = setup().await;
        let sub = coordinator.start().await.unwrap();

        // data-plane subscription that should stop receiving while drained
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let data_sub = queue
            .subscribe(
                "main",
                queues::WORKER_RESULT,
                "observer",
                handler_fn(move |_delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        tx.send(()).unwrap();
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        coordinator.broadcast_enter("rolling restart").await.unwrap();
        wait_for(&coordinator, 1).await;
        assert_eq!(registry.instance().await.state, ServiceState::Terminating);

        let envelope = Envelope::new(
            TenantScopedKey::new("main"),
            &serde_json::json!({ "n": 1 }),
        )
        .unwrap();
        queue.emit(queues::WORKER_RESULT, &envelope).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());

        coordinator.broadcast_exit("restart done").await.unwrap();
        wait_for(&coordinator, 2).await;
        assert_eq!(registry.instance().await.state, ServiceState::Running);
        assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .is_ok());

        data_sub.cancel().await;
        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_undecodable_event_is_skipped() {
        let (queue, _registry, coordinator) = setup().await;
        let sub = coordinator.start().await.unwrap();
        let group = coordinator.registry.instance_id().await;

        // well-formed envelope whose payload is not a cluster event
        let bogus = Envelope::new(
            TenantScopedKey::new("main"),
            &serde_json::json!({ "not": "an event" }),
        )
        .unwrap();
        queue.emit(queues::CLUSTER_EVENT, &bogus).await.unwrap();
        coordinator.broadcast_enter("drain").await.unwrap();

        wait_for(&coordinator, 1).await;
        // the bad message was committed, not left for redelivery
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while queue.pending("main", queues::CLUSTER_EVENT, &group).await > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "undecodable event left pending"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_duplicate_event_is_single_transition() {
        let (queue, _registry, coordinator) = setup().await;
        let sub = coordinator.start().await.unwrap();

        let event = ClusterEvent::maintenance_enter("drain");
        let envelope = event.to_envelope("main").unwrap();
        queue.emit(queues::CLUSTER_EVENT, &envelope).await.unwrap();
        queue.emit(queues::CLUSTER_EVENT, &envelope).await.unwrap();

        wait_for(&coordinator, 1).await;
        // second delivery must not apply again
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.applied_transitions(), 1);

        sub.cancel().await;
    }
}
