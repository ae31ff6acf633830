use thiserror::Error;


/// Unified error type for the coordination layer.
///
/// Every crate in the workspace returns `CoordinatorResult`; binaries may
/// wrap it in `anyhow` at the very edge.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The transport could not durably hand off a message. The caller must
    /// treat the message as undelivered and decide its own retry policy.
    #[error("queue error: {0}")]
    Queue(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// A received message could not be decoded into the expected type.
    /// Isolated per message; never tears down a subscription.
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("Tenant id can only be 'main', got '{requested}'")]
    TenantMismatch { requested: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("job execution error: {0}")]
    JobExecution(String),
    #[error("service instance not found: {id}")]
    ServiceNotFound { id: String },
    #[error("operation timeout: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl CoordinatorError {
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn tenant_mismatch<S: Into<String>>(requested: S) -> Self {
        Self::TenantMismatch {
            requested: requested.into(),
        }
    }
    pub fn job_not_found<S: Into<String>>(job_id: S) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Configuration and internal errors must fail fast at startup, not at
    /// message time.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Configuration(_) | CoordinatorError::Internal(_)
        )
    }

    /// Transport unavailability is recoverable: back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Queue(_)
                | CoordinatorError::Database(_)
                | CoordinatorError::Redis(_)
                | CoordinatorError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Deserialization(err.to_string())
    }
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(err: anyhow::Error) -> Self {
        CoordinatorError::Internal(err.to_string())
    }
}
