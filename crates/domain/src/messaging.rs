use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use conductor_errors::CoordinatorResult;

use crate::entities::Envelope;

/// A message that arrived but could not be decoded into an [`Envelope`].
/// Delivered to the handler as the error side of [`Delivery`] so the
/// subscription keeps consuming subsequent messages.
#[derive(Debug, Clone)]
pub struct MalformedEnvelope {
    pub queue: String,
    pub reason: String,
}

/// What a subscription hands to its handler for every received message:
/// either a decoded envelope or a tagged deserialization failure.
pub type Delivery = Result<Envelope, MalformedEnvelope>;

/// Per-subscription message callback. Returning an error means "do not
/// commit this message"; the transport redelivers it later
/// (at-least-once). A returned error never stops the subscription loop.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> CoordinatorResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = CoordinatorResult<()>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> CoordinatorResult<()> {
        (self.0)(delivery).await
    }
}

/// Adapts a closure into a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoordinatorResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Cancellation handle returned by `subscribe`. Cancelling stops the loop
/// after the in-flight batch/message completes; it never interrupts a
/// handler mid-flight.
pub struct Subscription {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(stop_tx: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { stop_tx, handle }
    }

    /// Channel pair for a subscription loop; the receiver flips to `true`
    /// when the subscription is cancelled.
    pub fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    pub async fn cancel(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Cooperative queue-wide backpressure switch. Pausing stops delivery to
/// subscribers without tearing down their loops; `emit` keeps working so
/// nothing produced during the pause is lost.
#[derive(Debug)]
pub struct PauseGate {
    paused_tx: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self { paused_tx }
    }

    /// `send_replace` updates the flag even when no waiter currently
    /// holds a receiver, so a pause issued between polls still gates the
    /// next `wait_until_resumed` call.
    pub fn pause(&self) {
        self.paused_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Blocks while the gate is paused; returns immediately otherwise.
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.paused_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend-agnostic produce/consume contract. Two structurally different
/// transports implement it (polling store and log stream), plus an
/// in-memory variant for embedded deployments and tests; all commit only
/// to at-least-once delivery per consumer group and no ordering guarantee
/// across partition keys.
#[async_trait]
pub trait CoordinationQueue: Send + Sync {
    /// Durably hands an envelope to the transport. A rejection or an
    /// unreachable backend surfaces as `CoordinatorError::Queue`; the
    /// caller must treat the message as undelivered.
    async fn emit(&self, queue: &str, envelope: &Envelope) -> CoordinatorResult<()>;

    /// Competitive consumption within `consumer_group`: each message on
    /// `queue` for the given tenant is delivered to exactly one live
    /// group member per delivery attempt.
    async fn subscribe(
        &self,
        tenant_id: &str,
        queue: &str,
        consumer_group: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription>;

    /// Worker-job variant of `subscribe`: delivery is scoped by worker
    /// group. A worker subscribed with `Some(group)` only sees jobs with
    /// that group affinity; a worker with `None` sees every job.
    async fn subscribe_worker(
        &self,
        tenant_id: &str,
        worker_id: &str,
        worker_group: Option<&str>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription>;

    /// Stops delivering to subscribers until `resume`; `emit` keeps
    /// accepting. Used for maintenance draining.
    fn pause(&self);

    fn resume(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_gate_blocks_until_resumed() {
        let gate = Arc::new(PauseGate::new());
        assert!(!gate.is_paused());

        gate.pause();
        gate.pause(); // idempotent
        assert!(gate.is_paused());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_until_resumed().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released on resume")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_applies_without_live_waiters() {
        let gate = PauseGate::new();

        // a waiter that comes and goes must not pin the gate state
        gate.wait_until_resumed().await;

        gate.pause();
        assert!(gate.is_paused());

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), gate.wait_until_resumed()).await;
        assert!(blocked.is_err(), "fresh waiter must block on a paused gate");

        gate.resume();
        assert!(!gate.is_paused());
        gate.wait_until_resumed().await;
    }

    #[tokio::test]
    async fn test_subscription_cancel_stops_loop() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let handle = {
            let seen = seen.clone();
            tokio::spawn(async move {
                loop {
                    if *stop_rx.borrow_and_update() {
                        break;
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
            })
        };

        let subscription = Subscription::new(stop_tx, handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        subscription.cancel().await;
        let after_cancel = seen.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_handler_fn_adapts_closures() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = {
            let count = count.clone();
            handler_fn(move |delivery| {
                let count = count.clone();
                async move {
                    assert!(delivery.is_err());
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let malformed = MalformedEnvelope {
            queue: "worker-job".to_string(),
            reason: "not json".to_string(),
        };
        handler.handle(Err(malformed)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
