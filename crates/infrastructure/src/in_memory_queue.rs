use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use conductor_domain::messaging::{
    CoordinationQueue, Delivery, DeliveryHandler, MalformedEnvelope, PauseGate, Subscription,
};
use conductor_domain::Envelope;
use conductor_errors::{CoordinatorError, CoordinatorResult};

use crate::WORKER_CONSUMER_GROUP;

/// Process-local queue for embedded deployments and tests.
///
/// Implements the full coordination contract: consumer-group competitive
/// consumption, worker-group delivery scoping, pause/resume and
/// redelivery of messages whose handler failed. Frames are stored as raw
/// bytes so a malformed message is expressible and surfaces to handlers
/// the same way it would on a real transport.
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    gate: Arc<PauseGate>,
    notify: Arc<Notify>,
    poll_interval_ms: u64,
}

#[derive(Default)]
struct QueueState {
    // (tenant, queue) -> consumer group -> pending frames
    topics: HashMap<(String, String), HashMap<String, VecDeque<Frame>>>,
}

#[derive(Clone)]
struct Frame {
    bytes: Vec<u8>,
    group_key: Option<String>,
}

#[derive(Clone)]
enum GroupFilter {
    /// Regular consumer-group subscription, or a worker with no group:
    /// sees every frame.
    Any,
    /// Worker registered under a group: sees only frames with that
    /// affinity.
    Exact(String),
}

impl GroupFilter {
    fn matches(&self, frame: &Frame) -> bool {
        match self {
            GroupFilter::Any => true,
            GroupFilter::Exact(group) => frame.group_key.as_deref() == Some(group),
        }
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            gate: Arc::new(PauseGate::new()),
            notify: Arc::new(Notify::new()),
            poll_interval_ms: 10,
        }
    }

    /// Pushes raw bytes to every registered group of a topic, bypassing
    /// envelope encoding. Lets tests and tooling inject frames that fail
    /// to decode.
    pub async fn emit_raw(&self, tenant_id: &str, queue: &str, bytes: Vec<u8>) {
        let group_key = Envelope::from_bytes(&bytes)
            .ok()
            .and_then(|e| e.key.partition_key);
        let mut state = self.state.lock().await;
        if let Some(groups) = state
            .topics
            .get_mut(&(tenant_id.to_string(), queue.to_string()))
        {
            for pending in groups.values_mut() {
                pending.push_back(Frame {
                    bytes: bytes.clone(),
                    group_key: group_key.clone(),
                });
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Pending frame count for one consumer group; test observability.
    pub async fn pending(&self, tenant_id: &str, queue: &str, consumer_group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .topics
            .get(&(tenant_id.to_string(), queue.to_string()))
            .and_then(|groups| groups.get(consumer_group))
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    async fn register_group(&self, tenant_id: &str, queue: &str, consumer_group: &str) {
        let mut state = self.state.lock().await;
        state
            .topics
            .entry((tenant_id.to_string(), queue.to_string()))
            .or_default()
            .entry(consumer_group.to_string())
            .or_default();
    }

    fn spawn_loop(
        &self,
        tenant_id: String,
        queue: String,
        consumer_group: String,
        filter: GroupFilter,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Subscription {
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let state = Arc::clone(&self.state);
        let gate = Arc::clone(&self.gate);
        let notify = Arc::clone(&self.notify);
        let poll_interval_ms = self.poll_interval_ms;

        let pausable = !conductor_domain::queues::is_control(&queue);
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow_and_update() {
                    break;
                }
                if pausable {
                    tokio::select! {
                        _ = gate.wait_until_resumed() => {}
                        _ = stop_rx.changed() => { continue; }
                    }
                }

                let frame = {
                    let mut locked = state.lock().await;
                    locked
                        .topics
                        .get_mut(&(tenant_id.clone(), queue.clone()))
                        .and_then(|groups| groups.get_mut(&consumer_group))
                        .and_then(|pending| pop_matching(pending, &filter))
                };

                let Some(frame) = frame else {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms)) => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                };

                let delivery: Delivery = match Envelope::from_bytes(&frame.bytes) {
                    Ok(envelope) => Ok(envelope),
                    Err(e) => Err(MalformedEnvelope {
                        queue: queue.clone(),
                        reason: e.to_string(),
                    }),
                };
                let well_formed = delivery.is_ok();

                if let Err(e) = handler.handle(delivery).await {
                    warn!(queue = %queue, group = %consumer_group, error = %e,
                        "handler failed, message will be redelivered");
                    if well_formed {
                        let mut locked = state.lock().await;
                        if let Some(pending) = locked
                            .topics
                            .get_mut(&(tenant_id.clone(), queue.clone()))
                            .and_then(|groups| groups.get_mut(&consumer_group))
                        {
                            pending.push_back(frame);
                        }
                    }
                }
            }
            debug!(queue = %queue, group = %consumer_group, "subscription loop stopped");
        });

        Subscription::new(stop_tx, handle)
    }

}

fn pop_matching(pending: &mut VecDeque<Frame>, filter: &GroupFilter) -> Option<Frame> {
    let idx = pending.iter().position(|frame| filter.matches(frame))?;
    pending.remove(idx)
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationQueue for InMemoryQueue {
    async fn emit(&self, queue: &str, envelope: &Envelope) -> CoordinatorResult<()> {
        if envelope.tenant_id().is_empty() {
            return Err(CoordinatorError::queue(
                "envelope rejected: empty tenant id",
            ));
        }
        let bytes = envelope.to_bytes()?;
        let frame = Frame {
            bytes,
            group_key: envelope.key.partition_key.clone(),
        };

        let mut state = self.state.lock().await;
        if let Some(groups) = state
            .topics
            .get_mut(&(envelope.tenant_id().to_string(), queue.to_string()))
        {
            for pending in groups.values_mut() {
                pending.push_back(frame.clone());
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        queue: &str,
        consumer_group: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription> {
        self.register_group(tenant_id, queue, consumer_group).await;
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            queue.to_string(),
            consumer_group.to_string(),
            GroupFilter::Any,
            handler,
        ))
    }

    async fn subscribe_worker(
        &self,
        tenant_id: &str,
        worker_id: &str,
        worker_group: Option<&str>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription> {
        debug!(worker_id, ?worker_group, "registering worker subscription");
        self.register_group(tenant_id, conductor_domain::queues::WORKER_JOB, WORKER_CONSUMER_GROUP)
            .await;
        let filter = match worker_group {
            Some(group) => GroupFilter::Exact(group.to_string()),
            None => GroupFilter::Any,
        };
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            conductor_domain::queues::WORKER_JOB.to_string(),
            WORKER_CONSUMER_GROUP.to_string(),
            filter,
            handler,
        ))
    }

    fn pause(&self) {
        self.gate.pause();
    }

    fn resume(&self) {
        self.gate.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_domain::messaging::handler_fn;
    use conductor_domain::{queues, TenantScopedKey};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn envelope(tenant: &str, group: Option<&str>, marker: u64) -> Envelope {
        let key = match group {
            Some(g) => TenantScopedKey::partitioned(tenant, g),
            None => TenantScopedKey::new(tenant),
        };
        Envelope::new(key, &json!({ "marker": marker })).unwrap()
    }

    async fn recv_markers(rx: &mut mpsc::UnboundedReceiver<u64>, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        for _ in 0..n {
            let marker = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("channel closed");
            out.push(marker);
        }
        out
    }

    fn collecting_handler(tx: mpsc::UnboundedSender<u64>) -> Arc<dyn DeliveryHandler> {
        handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                if let Ok(envelope) = delivery {
                    let marker = envelope.payload["marker"].as_u64().unwrap();
                    tx.send(marker).unwrap();
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_consumer_group_competitive_delivery() {
        let queue = InMemoryQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub_a = queue
            .subscribe("main", "events", "grp", collecting_handler(tx.clone()))
            .await
            .unwrap();
        let sub_b = queue
            .subscribe("main", "events", "grp", collecting_handler(tx.clone()))
            .await
            .unwrap();

        for marker in 0..10 {
            queue
                .emit("events", &envelope("main", None, marker))
                .await
                .unwrap();
        }

        let mut markers = recv_markers(&mut rx, 10).await;
        markers.sort_unstable();
        assert_eq!(markers, (0..10).collect::<Vec<_>>());
        // nothing delivered twice
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());

        sub_a.cancel().await;
        sub_b.cancel().await;
    }

    #[tokio::test]
    async fn test_independent_groups_each_see_full_stream() {
        let queue = InMemoryQueue::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let sub_a = queue
            .subscribe("main", "events", "grp-a", collecting_handler(tx_a))
            .await
            .unwrap();
        let sub_b = queue
            .subscribe("main", "events", "grp-b", collecting_handler(tx_b))
            .await
            .unwrap();

        queue
            .emit("events", &envelope("main", None, 7))
            .await
            .unwrap();

        assert_eq!(recv_markers(&mut rx_a, 1).await, vec![7]);
        assert_eq!(recv_markers(&mut rx_b, 1).await, vec![7]);

        sub_a.cancel().await;
        sub_b.cancel().await;
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let queue = InMemoryQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = queue
            .subscribe("main", "events", "grp", collecting_handler(tx))
            .await
            .unwrap();

        // same logical queue, different tenant: must not be observed
        queue
            .emit("events", &envelope("other", None, 1))
            .await
            .unwrap();
        queue
            .emit("events", &envelope("main", None, 2))
            .await
            .unwrap();

        assert_eq!(recv_markers(&mut rx, 1).await, vec![2]);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());

        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_isolated() {
        let queue = InMemoryQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let malformed_seen = Arc::new(AtomicUsize::new(0));

        let handler = {
            let tx = tx.clone();
            let malformed_seen = malformed_seen.clone();
            handler_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                let malformed_seen = malformed_seen.clone();
                async move {
                    match delivery {
                        Ok(envelope) => {
                            tx.send(envelope.payload["marker"].as_u64().unwrap()).unwrap();
                        }
                        Err(_) => {
                            malformed_seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Ok(())
                }
            })
        };

        let sub = queue
            .subscribe("main", "events", "grp", handler)
            .await
            .unwrap();

        queue
            .emit("events", &envelope("main", None, 1))
            .await
            .unwrap();
        queue
            .emit_raw("main", "events", b"this is not an envelope".to_vec())
            .await;
        queue
            .emit("events", &envelope("main", None, 2))
            .await
            .unwrap();

        assert_eq!(recv_markers(&mut rx, 2).await, vec![1, 2]);
        assert_eq!(malformed_seen.load(Ordering::SeqCst), 1);

        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_pause_buffers_and_resume_delivers() {
        let queue = InMemoryQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = queue
            .subscribe("main", "events", "grp", collecting_handler(tx))
            .await
            .unwrap();

        queue.pause();
        for marker in 0..5 {
            queue
                .emit("events", &envelope("main", None, marker))
                .await
                .unwrap();
        }
        // paused: nothing may arrive
        assert!(tokio::time::timeout(Duration::from_millis(80), rx.recv())
            .await
            .is_err());
        assert_eq!(queue.pending("main", "events", "grp").await, 5);

        queue.resume();
        let mut markers = recv_markers(&mut rx, 5).await;
        markers.sort_unstable();
        assert_eq!(markers, vec![0, 1, 2, 3, 4]);

        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_failed_handler_redelivers() {
        let queue = InMemoryQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler = {
            let attempts = attempts.clone();
            let tx = tx.clone();
            handler_fn(move |delivery: Delivery| {
                let attempts = attempts.clone();
                let tx = tx.clone();
                async move {
                    let envelope = delivery.expect("well-formed");
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(CoordinatorError::Internal("transient".into()));
                    }
                    tx.send(envelope.payload["marker"].as_u64().unwrap()).unwrap();
                    Ok(())
                }
            })
        };

        let sub = queue
            .subscribe("main", "events", "grp", handler)
            .await
            .unwrap();
        queue
            .emit("events", &envelope("main", None, 9))
            .await
            .unwrap();

        assert_eq!(recv_markers(&mut rx, 1).await, vec![9]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_worker_group_scoping() {
        let queue = InMemoryQueue::new();
        let (tx_docker, mut rx_docker) = mpsc::unbounded_channel();
        let (tx_any, mut rx_any) = mpsc::unbounded_channel();

        let docker_sub = queue
            .subscribe_worker("main", "w1", Some("docker"), collecting_handler(tx_docker))
            .await
            .unwrap();

        // grouped job and ungrouped job
        queue
            .emit(queues::WORKER_JOB, &envelope("main", Some("docker"), 1))
            .await
            .unwrap();
        queue
            .emit(queues::WORKER_JOB, &envelope("main", None, 2))
            .await
            .unwrap();

        assert_eq!(recv_markers(&mut rx_docker, 1).await, vec![1]);
        // docker-only worker must not see the ungrouped job
        assert!(
            tokio::time::timeout(Duration::from_millis(80), rx_docker.recv())
                .await
                .is_err()
        );

        // an unfiltered worker picks up what is left
        let any_sub = queue
            .subscribe_worker("main", "w2", None, collecting_handler(tx_any))
            .await
            .unwrap();
        assert_eq!(recv_markers(&mut rx_any, 1).await, vec![2]);

        docker_sub.cancel().await;
        any_sub.cancel().await;
    }
}
