use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conductor_domain::messaging::{
    CoordinationQueue, Delivery, DeliveryHandler, MalformedEnvelope, PauseGate, Subscription,
};
use conductor_domain::Envelope;
use conductor_errors::{CoordinatorError, CoordinatorResult};

use crate::WORKER_CONSUMER_GROUP;

/// Store-backed transport polling a relational table.
///
/// Every message is materialized as one row per registered consumer
/// group; consumers of a group compete for rows with `FOR UPDATE SKIP
/// LOCKED`. A claimed row carries a lock lease, so a consumer that dies
/// mid-processing releases its messages for redelivery once the lease
/// expires. Group registrations carry a lease of their own: each poll
/// loop keeps its group's `last_seen` fresh, and emit prunes groups
/// idle past the group TTL together with their retained rows.
pub struct PostgresQueue {
    pool: PgPool,
    gate: Arc<PauseGate>,
    poll_interval: Duration,
    batch_size: i64,
    lock_ttl_seconds: i64,
    group_ttl_seconds: i64,
}

const CREATE_MESSAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_message (
    id              BIGSERIAL PRIMARY KEY,
    tenant_id       TEXT        NOT NULL,
    queue           TEXT        NOT NULL,
    consumer_group  TEXT        NOT NULL,
    group_key       TEXT,
    payload         BYTEA       NOT NULL,
    state           TEXT        NOT NULL DEFAULT 'PENDING',
    locked_by       TEXT,
    locked_until    TIMESTAMPTZ,
    produced_at     TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_MESSAGE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_message_claim
    ON queue_message (tenant_id, queue, consumer_group, state, id)
"#;

const CREATE_GROUP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_consumer_group (
    tenant_id       TEXT NOT NULL,
    queue           TEXT NOT NULL,
    consumer_group  TEXT NOT NULL,
    last_seen       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (tenant_id, queue, consumer_group)
)
"#;

/// Registration doubles as keepalive: every subscription re-runs this
/// periodically so its group's `last_seen` stays fresh.
const REGISTER_GROUP_SQL: &str = "INSERT INTO queue_consumer_group \
         (tenant_id, queue, consumer_group) VALUES ($1, $2, $3) \
     ON CONFLICT (tenant_id, queue, consumer_group) \
         DO UPDATE SET last_seen = now()";

/// Groups nobody has kept alive within the TTL are gone for good; their
/// retained rows go with them so fan-out to dead instances is bounded.
const PRUNE_GROUPS_SQL: &str = "DELETE FROM queue_consumer_group \
     WHERE tenant_id = $1 AND queue = $2 \
       AND last_seen < now() - make_interval(secs => $3) \
     RETURNING consumer_group";

impl PostgresQueue {
    pub fn new(
        pool: PgPool,
        poll_interval_ms: u64,
        batch_size: u32,
        lock_ttl_seconds: u64,
        group_ttl_seconds: u64,
    ) -> Self {
        Self {
            pool,
            gate: Arc::new(PauseGate::new()),
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size: i64::from(batch_size),
            lock_ttl_seconds: lock_ttl_seconds as i64,
            group_ttl_seconds: group_ttl_seconds as i64,
        }
    }

    /// Creates the message and consumer-group tables if missing.
    /// Idempotent; safe to run on every process start.
    pub async fn ensure_schema(&self) -> CoordinatorResult<()> {
        sqlx::query(CREATE_MESSAGE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_MESSAGE_INDEX).execute(&self.pool).await?;
        sqlx::query(CREATE_GROUP_TABLE).execute(&self.pool).await?;
        info!("queue schema ready");
        Ok(())
    }

    async fn register_group(
        &self,
        tenant_id: &str,
        queue: &str,
        consumer_group: &str,
    ) -> CoordinatorResult<()> {
        touch_group(&self.pool, tenant_id, queue, consumer_group).await
    }

    fn spawn_loop(
        &self,
        tenant_id: String,
        queue: String,
        consumer_group: String,
        group_filter: Option<String>,
        consumer_id: String,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Subscription {
        let (stop_tx, mut stop_rx) = Subscription::stop_channel();
        let pool = self.pool.clone();
        let gate = Arc::clone(&self.gate);
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;
        let lock_ttl_seconds = self.lock_ttl_seconds;
        let touch_interval =
            Duration::from_secs((self.group_ttl_seconds as u64 / 3).max(1));

        let pausable = !conductor_domain::queues::is_control(&queue);
        let handle = tokio::spawn(async move {
            let mut last_touch = tokio::time::Instant::now();
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

                // keepalive so an idle group outlives its TTL
                if last_touch.elapsed() >= touch_interval {
                    if let Err(e) =
                        touch_group(&pool, &tenant_id, &queue, &consumer_group).await
                    {
                        warn!(group = %consumer_group, error = %e, "group keepalive failed");
                    }
                    last_touch = tokio::time::Instant::now();
                }

                let rows = match claim_batch(
                    &pool,
                    &tenant_id,
                    &queue,
                    &consumer_group,
                    group_filter.as_deref(),
                    &consumer_id,
                    batch_size,
                    lock_ttl_seconds,
                )
                .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "claim failed, backing off");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                if rows.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                }

                for (id, payload) in rows {
                    let delivery: Delivery = match Envelope::from_bytes(&payload) {
                        Ok(envelope) => Ok(envelope),
                        Err(e) => Err(MalformedEnvelope {
                            queue: queue.clone(),
                            reason: e.to_string(),
                        }),
                    };
                    let well_formed = delivery.is_ok();

                    match handler.handle(delivery).await {
                        Ok(()) => {
                            if let Err(e) = ack(&pool, id, &consumer_id).await {
                                error!(message_id = id, error = %e, "ack failed");
                            }
                        }
                        Err(e) if well_formed => {
                            warn!(message_id = id, error = %e,
                                "handler failed, releasing message for redelivery");
                            if let Err(e) = release(&pool, id, &consumer_id).await {
                                error!(message_id = id, error = %e, "release failed");
                            }
                        }
                        Err(e) => {
                            // Malformed frames are never retried; a decode
                            // failure is permanent.
                            warn!(message_id = id, error = %e,
                                "handler failed on malformed frame, discarding");
                            if let Err(e) = ack(&pool, id, &consumer_id).await {
                                error!(message_id = id, error = %e, "ack failed");
                            }
                        }
                    }
                }
            }
            debug!(queue = %queue, group = %consumer_group, "poll loop stopped");
        });

        Subscription::new(stop_tx, handle)
    }
}

/// Claim statement for one poll round. Rows are eligible when pending or
/// when a previous claimant's lease has lapsed. A null group filter
/// matches every row, so an unscoped consumer drains grouped and
/// ungrouped messages alike.
const CLAIM_SQL: &str = "UPDATE queue_message SET state = 'RUNNING', locked_by = $6, \
         locked_until = now() + make_interval(secs => $7) \
     WHERE id IN ( \
         SELECT id FROM queue_message \
         WHERE tenant_id = $1 AND queue = $2 AND consumer_group = $3 \
           AND (state = 'PENDING' OR (state = 'RUNNING' AND locked_until < now())) \
           AND ($5::text IS NULL OR group_key = $5) \
         ORDER BY id \
         LIMIT $4 \
         FOR UPDATE SKIP LOCKED \
     ) \
     RETURNING id, payload";

#[allow(clippy::too_many_arguments)]
async fn claim_batch(
    pool: &PgPool,
    tenant_id: &str,
    queue: &str,
    consumer_group: &str,
    group_filter: Option<&str>,
    consumer_id: &str,
    batch_size: i64,
    lock_ttl_seconds: i64,
) -> CoordinatorResult<Vec<(i64, Vec<u8>)>> {
    let rows = sqlx::query(CLAIM_SQL)
        .bind(tenant_id)
        .bind(queue)
        .bind(consumer_group)
        .bind(batch_size)
        .bind(group_filter)
        .bind(consumer_id)
        .bind(lock_ttl_seconds as f64)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get::<i64, _>("id"), row.get::<Vec<u8>, _>("payload")))
        .collect())
}

async fn touch_group(
    pool: &PgPool,
    tenant_id: &str,
    queue: &str,
    consumer_group: &str,
) -> CoordinatorResult<()> {
    sqlx::query(REGISTER_GROUP_SQL)
        .bind(tenant_id)
        .bind(queue)
        .bind(consumer_group)
        .execute(pool)
        .await?;
    Ok(())
}

async fn ack(pool: &PgPool, id: i64, consumer_id: &str) -> CoordinatorResult<()> {
    sqlx::query("DELETE FROM queue_message WHERE id = $1 AND locked_by = $2")
        .bind(id)
        .bind(consumer_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn release(pool: &PgPool, id: i64, consumer_id: &str) -> CoordinatorResult<()> {
    sqlx::query(
        "UPDATE queue_message \
         SET state = 'PENDING', locked_by = NULL, locked_until = NULL \
         WHERE id = $1 AND locked_by = $2",
    )
    .bind(id)
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl CoordinationQueue for PostgresQueue {
    async fn emit(&self, queue: &str, envelope: &Envelope) -> CoordinatorResult<()> {
        if envelope.tenant_id().is_empty() {
            return Err(CoordinatorError::queue(
                "envelope rejected: empty tenant id",
            ));
        }
        let payload = envelope.to_bytes()?;

        let mut tx = self.pool.begin().await?;

        let pruned: Vec<String> = sqlx::query_scalar(PRUNE_GROUPS_SQL)
            .bind(envelope.tenant_id())
            .bind(queue)
            .bind(self.group_ttl_seconds as f64)
            .fetch_all(&mut *tx)
            .await?;
        for group in &pruned {
            sqlx::query(
                "DELETE FROM queue_message \
                 WHERE tenant_id = $1 AND queue = $2 AND consumer_group = $3",
            )
            .bind(envelope.tenant_id())
            .bind(queue)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        if !pruned.is_empty() {
            info!(queue, pruned = pruned.len(), "expired consumer groups dropped");
        }

        let groups: Vec<String> = sqlx::query_scalar(
            "SELECT consumer_group FROM queue_consumer_group \
             WHERE tenant_id = $1 AND queue = $2",
        )
        .bind(envelope.tenant_id())
        .bind(queue)
        .fetch_all(&mut *tx)
        .await?;

        // One row per group so each group consumes independently. No
        // registered groups means no retained copies, matching log
        // transports without subscribers.
        for group in &groups {
            sqlx::query(
                "INSERT INTO queue_message \
                     (tenant_id, queue, consumer_group, group_key, payload) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(envelope.tenant_id())
            .bind(queue)
            .bind(group)
            .bind(envelope.key.partition_key.as_deref())
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(queue, groups = groups.len(), "message emitted");
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        queue: &str,
        consumer_group: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CoordinatorResult<Subscription> {
        self.register_group(tenant_id, queue, consumer_group).await?;
        let consumer_id = format!("{consumer_group}-{}", Uuid::new_v4());
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            queue.to_string(),
            consumer_group.to_string(),
            None,
            consumer_id,
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
        self.register_group(
            tenant_id,
            conductor_domain::queues::WORKER_JOB,
            WORKER_CONSUMER_GROUP,
        )
        .await?;
        debug!(worker_id, ?worker_group, "worker poll loop starting");
        Ok(self.spawn_loop(
            tenant_id.to_string(),
            conductor_domain::queues::WORKER_JOB.to_string(),
            WORKER_CONSUMER_GROUP.to_string(),
            worker_group.map(str::to_string),
            worker_id.to_string(),
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

    #[test]
    fn test_claim_sql_shape() {
        assert!(CLAIM_SQL.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_SQL.contains("RETURNING id, payload"));
        assert!(CLAIM_SQL.contains("group_key = $5"));
        // lease takeover of expired claims
        assert!(CLAIM_SQL.contains("locked_until < now()"));
    }

    #[test]
    fn test_group_registry_sql_shape() {
        assert!(CREATE_GROUP_TABLE.contains("last_seen"));
        // registration doubles as keepalive
        assert!(REGISTER_GROUP_SQL.contains("ON CONFLICT"));
        assert!(REGISTER_GROUP_SQL.contains("last_seen = now()"));
        // expiry drops the group and reports which ones went
        assert!(PRUNE_GROUPS_SQL.contains("make_interval"));
        assert!(PRUNE_GROUPS_SQL.contains("RETURNING consumer_group"));
    }
}
