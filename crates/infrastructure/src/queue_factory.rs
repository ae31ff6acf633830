use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use conductor_config::models::{AppConfig, QueueBackend};
use conductor_domain::messaging::CoordinationQueue;
use conductor_errors::{CoordinatorError, CoordinatorResult};

use crate::{InMemoryQueue, PostgresQueue, RedisStreamQueue};

/// Builds the configured transport behind the queue trait object. All
/// services of a process share the returned instance so pause and resume
/// apply process-wide.
pub struct QueueFactory;

impl QueueFactory {
    pub async fn create(config: &AppConfig) -> CoordinatorResult<Arc<dyn CoordinationQueue>> {
        debug!(backend = config.queue.backend_str(), "creating coordination queue");

        match config.queue.backend {
            QueueBackend::InMemory => {
                info!("initializing in-memory queue");
                Ok(Arc::new(InMemoryQueue::new()))
            }
            QueueBackend::Postgres => {
                info!("initializing postgres-backed queue");
                let pool = PgPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .min_connections(config.database.min_connections)
                    .acquire_timeout(std::time::Duration::from_secs(
                        config.database.connection_timeout_seconds,
                    ))
                    .connect(&config.database.url)
                    .await?;
                let queue = PostgresQueue::new(
                    pool,
                    config.queue.poll_interval_ms,
                    config.queue.batch_size,
                    config.queue.lock_ttl_seconds,
                    config.queue.group_ttl_seconds,
                );
                queue.ensure_schema().await?;
                Ok(Arc::new(queue))
            }
            QueueBackend::RedisStream => {
                info!("initializing redis stream queue");
                let redis = config.queue.redis.as_ref().ok_or_else(|| {
                    CoordinatorError::config(
                        "redis stream backend selected but [queue.redis] section is missing",
                    )
                })?;
                let queue = RedisStreamQueue::connect(
                    &redis.url,
                    redis.partition_count as usize,
                    config.queue.batch_size as usize,
                    redis.block_millis,
                    redis.reclaim_idle_seconds,
                )
                .await?;
                Ok(Arc::new(queue))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_config::models::QueueConfig;

    #[tokio::test]
    async fn test_create_in_memory() {
        let mut config = AppConfig::default();
        config.queue = QueueConfig::in_memory();
        let queue = QueueFactory::create(&config).await.unwrap();
        // trait object is usable
        queue.pause();
        queue.resume();
    }

    #[tokio::test]
    async fn test_redis_backend_requires_redis_section() {
        let mut config = AppConfig::default();
        config.queue.backend = QueueBackend::RedisStream;
        config.queue.redis = None;
        let err = match QueueFactory::create(&config).await {
            Ok(_) => panic!("expected a configuration error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("queue.redis"));
    }
}
