use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::validation::{
    validate_group_key, validate_not_empty, validate_positive, ConfigValidator,
};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// Polling queue backed by the relational execution store.
    Postgres,
    /// Log-based queue on Redis Streams.
    RedisStream,
    /// Process-local queue for embedded deployments and tests.
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/conductor".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_not_empty(&self.url, "database.url")?;
        if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
            return Err(ConfigError::Validation(
                "database.url must start with postgres:// or postgresql://".to_string(),
            ));
        }
        validate_positive(self.max_connections as u64, "database.max_connections")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_seconds: u64,
    /// Streams per (tenant, queue); partition-keyed messages hash into
    /// one of these, the rest round-robin.
    pub partition_count: u32,
    /// Pending entries idle longer than this are reclaimed from dead
    /// consumers.
    pub reclaim_idle_seconds: u64,
    pub block_millis: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout_seconds: 30,
            partition_count: 4,
            reclaim_idle_seconds: 60,
            block_millis: 500,
        }
    }
}

impl ConfigValidator for RedisConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_not_empty(&self.url, "redis.url")?;
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(ConfigError::Validation(
                "redis.url must start with redis:// or rediss://".to_string(),
            ));
        }
        validate_positive(self.partition_count as u64, "redis.partition_count")?;
        validate_positive(self.reclaim_idle_seconds, "redis.reclaim_idle_seconds")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis: Option<RedisConfig>,
    /// Polling backend: delay between claim attempts. Lower trades
    /// latency for store load.
    pub poll_interval_ms: u64,
    /// Polling backend: maximum rows claimed per cycle.
    pub batch_size: u32,
    /// Polling backend: claim lock lifetime; an expired lock makes the
    /// row claimable again.
    pub lock_ttl_seconds: u64,
    /// Polling backend: a consumer group no subscription has kept alive
    /// within this window is dropped together with its retained rows,
    /// so dead instances stop accumulating fan-out copies.
    pub group_ttl_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Postgres,
            redis: None,
            poll_interval_ms: 100,
            batch_size: 32,
            lock_ttl_seconds: 30,
            group_ttl_seconds: 600,
        }
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self.backend {
            QueueBackend::RedisStream => {
                let redis = self.redis.as_ref().ok_or_else(|| {
                    ConfigError::Validation(
                        "queue.backend = redis_stream requires a [queue.redis] section".to_string(),
                    )
                })?;
                redis.validate()?;
            }
            QueueBackend::Postgres => {
                validate_positive(self.poll_interval_ms, "queue.poll_interval_ms")?;
                validate_positive(self.batch_size as u64, "queue.batch_size")?;
                validate_positive(self.lock_ttl_seconds, "queue.lock_ttl_seconds")?;
                validate_positive(self.group_ttl_seconds, "queue.group_ttl_seconds")?;
                if self.group_ttl_seconds <= self.lock_ttl_seconds {
                    return Err(ConfigError::Validation(
                        "queue.group_ttl_seconds must exceed queue.lock_ttl_seconds".to_string(),
                    ));
                }
            }
            QueueBackend::InMemory => {}
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn in_memory() -> Self {
        Self {
            backend: QueueBackend::InMemory,
            redis: None,
            ..Self::default()
        }
    }

    pub fn parse_backend(backend: &str) -> ConfigResult<QueueBackend> {
        match backend.to_lowercase().as_str() {
            "postgres" => Ok(QueueBackend::Postgres),
            "redis_stream" => Ok(QueueBackend::RedisStream),
            "in_memory" => Ok(QueueBackend::InMemory),
            other => Err(ConfigError::Validation(format!(
                "Unsupported queue backend: {other}, supported backends: postgres, redis_stream, in_memory"
            ))),
        }
    }

    pub fn backend_str(&self) -> &'static str {
        match self.backend {
            QueueBackend::Postgres => "postgres",
            QueueBackend::RedisStream => "redis_stream",
            QueueBackend::InMemory => "in_memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub heartbeat_interval_seconds: u64,
    /// A service whose heartbeat is older than this is no longer part of
    /// the membership view.
    pub liveness_ttl_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            liveness_ttl_seconds: 60,
        }
    }
}

impl ConfigValidator for ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.heartbeat_interval_seconds,
            "cluster.heartbeat_interval_seconds",
        )?;
        validate_positive(self.liveness_ttl_seconds, "cluster.liveness_ttl_seconds")?;
        if self.liveness_ttl_seconds <= self.heartbeat_interval_seconds {
            return Err(ConfigError::Validation(
                "cluster.liveness_ttl_seconds must exceed the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// A Sent job without a result after this long is an abandonment
    /// candidate (only acted on once the worker group has no live member).
    pub result_timeout_seconds: u64,
    pub detection_interval_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            result_timeout_seconds: 90,
            detection_interval_seconds: 30,
            max_attempts: 3,
            backoff_base_seconds: 5,
        }
    }
}

impl ConfigValidator for DispatchConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.result_timeout_seconds, "dispatch.result_timeout_seconds")?;
        validate_positive(
            self.detection_interval_seconds,
            "dispatch.detection_interval_seconds",
        )?;
        validate_positive(self.max_attempts as u64, "dispatch.max_attempts")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub worker_group: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-001".to_string(),
            worker_group: None,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_group_key(&self.worker_id, "worker.worker_id")?;
        if let Some(group) = &self.worker_group {
            validate_group_key(group, "worker.worker_group")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Loads configuration from an optional TOML file with
    /// `CONDUCTOR_`-prefixed environment variables layered on top.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                anyhow::bail!("configuration file not found: {path}");
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for path in ["config/conductor.toml", "conductor.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(config)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.queue.validate()?;
        if self.queue.backend == QueueBackend::Postgres {
            self.database.validate()?;
        }
        self.cluster.validate()?;
        self.dispatch.validate()?;
        self.worker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.backend, QueueBackend::Postgres);
        assert_eq!(config.queue.batch_size, 32);
        assert_eq!(config.dispatch.max_attempts, 3);
    }

    #[test]
    fn test_redis_backend_requires_redis_section() {
        let config = QueueConfig {
            backend: QueueBackend::RedisStream,
            redis: None,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());

        let config = QueueConfig {
            backend: QueueBackend::RedisStream,
            redis: Some(RedisConfig::default()),
            ..QueueConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_group_ttl_must_exceed_lock_ttl() {
        let config = QueueConfig {
            lock_ttl_seconds: 30,
            group_ttl_seconds: 30,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_urls_fail_fast() {
        let db = DatabaseConfig {
            url: "mysql://localhost/conductor".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(db.validate().is_err());

        let redis = RedisConfig {
            url: "amqp://localhost".to_string(),
            ..RedisConfig::default()
        };
        assert!(redis.validate().is_err());
    }

    #[test]
    fn test_malformed_worker_group_is_rejected() {
        let worker = WorkerConfig {
            worker_id: "w1".to_string(),
            worker_group: Some("not a key".to_string()),
        };
        assert!(worker.validate().is_err());
    }

    #[test]
    fn test_liveness_ttl_must_exceed_heartbeat_interval() {
        let cluster = ClusterConfig {
            heartbeat_interval_seconds: 60,
            liveness_ttl_seconds: 30,
        };
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn test_parse_backend_strings() {
        assert_eq!(
            QueueConfig::parse_backend("postgres").unwrap(),
            QueueBackend::Postgres
        );
        assert_eq!(
            QueueConfig::parse_backend("REDIS_STREAM").unwrap(),
            QueueBackend::RedisStream
        );
        assert!(QueueConfig::parse_backend("kafka").is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[queue]
backend = "in_memory"
poll_interval_ms = 50
batch_size = 8
lock_ttl_seconds = 10
group_ttl_seconds = 120

[worker]
worker_id = "w-test"
worker_group = "docker"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::InMemory);
        assert_eq!(config.queue.batch_size, 8);
        assert_eq!(config.worker.worker_group.as_deref(), Some("docker"));
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AppConfig::load(Some("/nonexistent/conductor.toml")).is_err());
    }
}
