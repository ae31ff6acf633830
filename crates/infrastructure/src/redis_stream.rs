use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use conductor_domain::messaging::{
    CoordinationQueue, Delivery, DeliveryHandler, MalformedEnvelope, PauseGate, Subscription,
};
use conductor_domain::Envelope;
use conductor_errors::{CoordinatorError, CoordinatorResult};

use crate::WORKER_CONSUMER_GROUP;

const PAYLOAD_FIELD: &str = "payload";

/// Log-based transport over Redis Streams.
///
/// A logical queue maps to a set of physical streams: `p:{n}` partitions
/// for messages without affinity and one `k:{key}` stream per partition
/// key. The set of live streams for a queue is tracked in a registry set
/// so consumers can discover keyed streams that appear after they
/// subscribed; membership changes take effect on the next refresh of
/// that registry.
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    gate: Arc<PauseGate>,
    partition_count: usize,
    round_robin: AtomicUsize,
    batch_size: usize,
    block_millis: u64,
    reclaim_idle_millis: u64,
}

/// Which physical streams of a queue a subscription reads.
#[derive(Clone)]
enum StreamScope {
    /// All partitions plus every keyed stream in the registry.
    All,
    /// Exactly one keyed stream.
    Keyed(String),
}

fn stream_key(tenant_id: &str, queue: &str, suffix: &str) -> String {
    format!("conductor:{tenant_id}:{queue}:{suffix}")
}

fn registry_key(tenant_id: &str, queue: &str) -> String {
    format!("conductor:{tenant_id}:{queue}:streams")
}

fn partition_suffix(n: usize) -> String {
    format!("p:{n}")
}

fn keyed_suffix(key: &str) -> String {
    format!("k:{key}")
}

impl RedisStreamQueue {
    pub async fn connect(
        url: &str,
        partition_count: usize,
        batch_size: usize,
        block_millis: u64,
        reclaim_idle_seconds: u64,
    ) -> CoordinatorResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoordinatorError::queue(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        info!(partition_count, "connected to redis stream backend");
        Ok(Self {
            conn,
            gate: Arc::new(PauseGate::new()),
            partition_count: partition_count.max(1),
            round_robin: AtomicUsize::new(0),
            batch_size: batch_size.max(1),
            block_millis,
            reclaim_idle_millis: reclaim_idle_seconds * 1000,
        })
    }

    fn next_partition(&self) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partition_count
    }

    fn spawn_loop(
        &self,
        tenant_id: String,
        queue: String,
        consumer_group: String,
        consumer_id: String,
        scope: StreamScope,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Subscription {
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let mut conn = self.conn.clone();
        let gate = Arc::clone(&self.gate);
        let partition_count = self.partition_count;
        let batch_size = self.batch_size;
        let block_millis = self.block_millis;
        let reclaim_idle_millis = self.reclaim_idle_millis;

        let pausable = !conductor_domain::queues::is_control(&queue);
        let handle = tokio::spawn(async move {
            // Streams whose consumer group has already been created.
            let mut known: HashSet<String> = HashSet::new();

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

                let streams = match discover_streams(
                    &mut conn,
                    &tenant_id,
                    &queue,
                    &scope,
                    partition_count,
                )
                .await
                {
                    Ok(streams) => streams,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "stream discovery failed");
                        tokio::time::sleep(Duration::from_millis(block_millis)).await;
                        continue;
                    }
                };

                for stream in &streams {
                    if known.contains(stream) {
                        continue;
                    }
                    if let Err(e) = ensure_group(&mut conn, stream, &consumer_group).await {
                        error!(stream = %stream, error = %e, "consumer group setup failed");
                        continue;
                    }
                    known.insert(stream.clone());
                }

                let mut batch: Vec<(String, StreamId)> = Vec::new();

                // Take over messages a dead consumer left pending.
                for stream in &streams {
                    match reclaim_stale(
                        &mut conn,
                        stream,
                        &consumer_group,
                        &consumer_id,
                        reclaim_idle_millis,
                        batch_size,
                    )
                    .await
                    {
                        Ok(mut claimed) => {
                            batch.extend(claimed.drain(..).map(|id| (stream.clone(), id)))
                        }
                        Err(e) => warn!(stream = %stream, error = %e, "autoclaim failed"),
                    }
                }

                if batch.is_empty() {
                    let keys: Vec<&str> = streams.iter().map(String::as_str).collect();
                    let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
                    let opts = StreamReadOptions::default()
                        .group(&consumer_group, &consumer_id)
                        .count(batch_size)
                        .block(block_millis as usize);
                    let reply: StreamReadReply = match conn.xread_options(&keys, &ids, &opts).await
                    {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!(queue = %queue, error = %e, "stream read failed");
                            tokio::time::sleep(Duration::from_millis(block_millis)).await;
                            continue;
                        }
                    };
                    for key in reply.keys {
                        for id in key.ids {
                            batch.push((key.key.clone(), id));
                        }
                    }
                }

                for (stream, entry) in batch {
                    let delivery = decode_entry(&queue, &entry);
                    let well_formed = delivery.is_ok();
                    match handler.handle(delivery).await {
                        Ok(()) => {
                            ack_entry(&mut conn, &stream, &consumer_group, &entry.id).await;
                        }
                        Err(e) if well_formed => {
                            // Left pending; redelivered through autoclaim.
                            warn!(stream = %stream, entry = %entry.id, error = %e,
                                "handler failed, message stays pending");
                        }
                        Err(e) => {
                            warn!(stream = %stream, entry = %entry.id, error = %e,
                                "handler failed on malformed entry, discarding");
                            ack_entry(&mut conn, &stream, &consumer_group, &entry.id).await;
                        }
                    }
                }
            }
            debug!(queue = %queue, group = %consumer_group, "stream loop stopped");
        });

        Subscription::new(stop_tx, handle)
    }
}

async fn discover_streams(
    conn: &mut ConnectionManager,
    tenant_id: &str,
    queue: &str,
    scope: &StreamScope,
    partition_count: usize,
) -> CoordinatorResult<Vec<String>> {
    match scope {
        StreamScope::Keyed(group) => {
            Ok(vec![stream_key(tenant_id, queue, &keyed_suffix(group))])
        }
        StreamScope::All => {
            let registered: Vec<String> = conn.smembers(registry_key(tenant_id, queue)).await?;
            let mut suffixes: HashSet<String> =
                (0..partition_count).map(partition_suffix).collect();
            suffixes.extend(registered);
            let mut streams: Vec<String> = suffixes
                .into_iter()
                .map(|s| stream_key(tenant_id, queue, &s))
                .collect();
            streams.sort();
            Ok(streams)
        }
    }
}

async fn ensure_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> CoordinatorResult<()> {
    // Start at 0 so entries appended before the group existed are still
    // delivered.
    let result: redis::RedisResult<String> =
        conn.xgroup_create_mkstream(stream, group, "0").await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn reclaim_stale(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle_millis: u64,
    count: usize,
) -> CoordinatorResult<Vec<StreamId>> {
    let opts = StreamAutoClaimOptions::default().count(count);
    let reply: StreamAutoClaimReply = conn
        .xautoclaim_options(stream, group, consumer, min_idle_millis as usize, "0-0", opts)
        .await?;
    Ok(reply.claimed)
}

fn decode_entry(queue: &str, entry: &StreamId) -> Delivery {
    let bytes: Vec<u8> = match entry.map.get(PAYLOAD_FIELD) {
        Some(value) => redis::from_redis_value(value).unwrap_or_default(),
        None => Vec::new(),
    };
    match Envelope::from_bytes(&bytes) {
        Ok(envelope) => Ok(envelope),
        Err(e) => Err(MalformedEnvelope {
            queue: queue.to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn ack_entry(conn: &mut ConnectionManager, stream: &str, group: &str, entry_id: &str) {
    let result: redis::RedisResult<i64> = conn.xack(stream, group, &[entry_id]).await;
    if let Err(e) = result {
        error!(stream = %stream, entry = %entry_id, error = %e, "ack failed");
    }
}

#[async_trait]
impl CoordinationQueue for RedisStreamQueue {
    async fn emit(&self, queue: &str, envelope: &Envelope) -> CoordinatorResult<()> {
        if envelope.tenant_id().is_empty() {
            return Err(CoordinatorError::queue(
                "envelope rejected: empty tenant id",
            ));
        }
        let payload = envelope.to_bytes()?;
        let suffix = match &envelope.key.partition_key {
            Some(key) => keyed_suffix(key),
            None => partition_suffix(self.next_partition()),
        };
        let tenant_id = envelope.tenant_id();
        let stream = stream_key(tenant_id, queue, &suffix);

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(registry_key(tenant_id, queue), &suffix)
            .await?;
        let _: String = conn
            .xadd(&stream, "*", &[(PAYLOAD_FIELD, payload.as_slice())])
            .await?;
        debug!(queue, stream = %stream, "message appended");
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        queue: &str,
        consumer_group: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription> {
        let consumer_id = format!("{consumer_group}-{}", uuid::Uuid::new_v4());
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            queue.to_string(),
            consumer_group.to_string(),
            consumer_id,
            StreamScope::All,
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
        let scope = match worker_group {
            Some(group) => StreamScope::Keyed(group.to_string()),
            None => StreamScope::All,
        };
        debug!(worker_id, ?worker_group, "worker stream loop starting");
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            conductor_domain::queues::WORKER_JOB.to_string(),
            WORKER_CONSUMER_GROUP.to_string(),
            worker_id.to_string(),
            scope,
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
