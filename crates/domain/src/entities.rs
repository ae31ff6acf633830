use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conductor_errors::{CoordinatorError, CoordinatorResult};

/// Routing key of a queued item: the owning tenant plus an optional
/// partition key. Every envelope must resolve to a non-empty tenant id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScopedKey {
    pub tenant_id: String,
    pub partition_key: Option<String>,
}

impl TenantScopedKey {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            partition_key: None,
        }
    }

    pub fn partitioned(tenant_id: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            partition_key: Some(partition_key.into()),
        }
    }
}

/// Canonical wire representation of a queued item. The payload is an
/// untyped JSON value; consumers decode it into the record they expect
/// and treat a decode failure as a per-message deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: TenantScopedKey,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new<T: Serialize>(key: TenantScopedKey, record: &T) -> CoordinatorResult<Self> {
        if key.tenant_id.is_empty() {
            return Err(CoordinatorError::queue(
                "envelope rejected: empty tenant id",
            ));
        }
        Ok(Self {
            key,
            payload: serde_json::to_value(record)?,
            produced_at: Utc::now(),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.key.tenant_id
    }

    pub fn decode<T: DeserializeOwned>(&self) -> CoordinatorResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CoordinatorError::Deserialization(e.to_string()))
    }

    pub fn to_bytes(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CoordinatorResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoordinatorError::Deserialization(e.to_string()))
    }
}

/// A unit of executable work handed to a worker: either a task run or a
/// trigger evaluation. `job_id` is the correlation identifier and is kept
/// across retries so late results can still be recognized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub job_id: String,
    pub tenant_id: String,
    pub execution_id: String,
    /// None means the job is deliverable to any worker.
    pub worker_group: Option<String>,
    pub attempt: u32,
    pub kind: WorkerJobKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerJobKind {
    Task {
        flow: FlowNode,
        task_id: String,
        input: Value,
    },
    Trigger {
        flow: FlowNode,
        trigger_id: String,
        input: Value,
    },
}

impl WorkerJob {
    pub fn task(
        tenant_id: impl Into<String>,
        execution_id: impl Into<String>,
        flow: FlowNode,
        task_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            execution_id: execution_id.into(),
            worker_group: None,
            attempt: 0,
            kind: WorkerJobKind::Task {
                flow,
                task_id: task_id.into(),
                input,
            },
        }
    }

    pub fn trigger(
        tenant_id: impl Into<String>,
        execution_id: impl Into<String>,
        flow: FlowNode,
        trigger_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            execution_id: execution_id.into(),
            worker_group: None,
            attempt: 0,
            kind: WorkerJobKind::Trigger {
                flow,
                trigger_id: trigger_id.into(),
                input,
            },
        }
    }

    pub fn with_worker_group(mut self, worker_group: impl Into<String>) -> Self {
        self.worker_group = Some(worker_group.into());
        self
    }

    /// A retried delivery keeps the correlation id and bumps the attempt.
    pub fn next_attempt(&self) -> Self {
        let mut job = self.clone();
        job.attempt += 1;
        job
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, WorkerJobKind::Trigger { .. })
    }

    /// Envelope for the worker-job queue; the partition key carries the
    /// worker-group affinity so transports can route without inspecting
    /// the payload.
    pub fn to_envelope(&self) -> CoordinatorResult<Envelope> {
        let key = match &self.worker_group {
            Some(group) => TenantScopedKey::partitioned(&self.tenant_id, group),
            None => TenantScopedKey::new(&self.tenant_id),
        };
        Envelope::new(key, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultState {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    pub job_id: String,
    pub tenant_id: String,
    pub execution_id: String,
    pub state: ResultState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTriggerResult {
    pub job_id: String,
    pub tenant_id: String,
    pub execution_id: String,
    pub state: ResultState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Payload of the worker-result queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerResult {
    Task(WorkerTaskResult),
    Trigger(WorkerTriggerResult),
}

impl WorkerResult {
    pub fn success(job: &WorkerJob, output: Option<Value>) -> Self {
        Self::from_job(job, ResultState::Success, output, None)
    }

    pub fn failure(job: &WorkerJob, error: impl Into<String>) -> Self {
        Self::from_job(job, ResultState::Failed, None, Some(error.into()))
    }

    fn from_job(
        job: &WorkerJob,
        state: ResultState,
        output: Option<Value>,
        error: Option<String>,
    ) -> Self {
        let task = WorkerTaskResult {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            execution_id: job.execution_id.clone(),
            state,
            output,
            error,
            emitted_at: Utc::now(),
        };
        if job.is_trigger() {
            Self::Trigger(WorkerTriggerResult {
                job_id: task.job_id,
                tenant_id: task.tenant_id,
                execution_id: task.execution_id,
                state: task.state,
                output: task.output,
                error: task.error,
                emitted_at: task.emitted_at,
            })
        } else {
            Self::Task(task)
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Task(r) => &r.job_id,
            Self::Trigger(r) => &r.job_id,
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Task(r) => &r.tenant_id,
            Self::Trigger(r) => &r.tenant_id,
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::Task(r) => &r.execution_id,
            Self::Trigger(r) => &r.execution_id,
        }
    }

    pub fn state(&self) -> ResultState {
        match self {
            Self::Task(r) => r.state,
            Self::Trigger(r) => r.state,
        }
    }

    pub fn to_envelope(&self) -> CoordinatorResult<Envelope> {
        Envelope::new(TenantScopedKey::new(self.tenant_id()), self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventKind {
    MaintenanceEnter,
    MaintenanceExit,
}

/// Broadcast cluster-wide event. `uid` is generated at construction and
/// never reused; at-least-once delivery means consumers must deduplicate
/// by `uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub uid: String,
    pub kind: ClusterEventKind,
    pub event_date: DateTime<Utc>,
    pub message: String,
}

impl ClusterEvent {
    pub fn maintenance_enter(message: impl Into<String>) -> Self {
        Self::new(ClusterEventKind::MaintenanceEnter, message)
    }

    pub fn maintenance_exit(message: impl Into<String>) -> Self {
        Self::new(ClusterEventKind::MaintenanceExit, message)
    }

    fn new(kind: ClusterEventKind, message: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            kind,
            event_date: Utc::now(),
            message: message.into(),
        }
    }

    pub fn to_envelope(&self, tenant_id: &str) -> CoordinatorResult<Envelope> {
        Envelope::new(TenantScopedKey::new(tenant_id), self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Executor,
    Indexer,
    Scheduler,
    Webserver,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Created,
    Running,
    Terminating,
    TerminatedGracefully,
    TerminatedForced,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::TerminatedGracefully | ServiceState::TerminatedForced
        )
    }
}

/// A live service instance as carried on the heartbeat queue. Mutated by
/// the owning process only; read through the membership view which applies
/// TTL expiry on `last_heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub worker_group: Option<String>,
    pub hostname: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(kind: ServiceKind, hostname: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            state: ServiceState::Created,
            worker_group: None,
            hostname: hostname.into(),
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_worker_group(mut self, worker_group: Option<String>) -> Self {
        self.worker_group = worker_group;
        self
    }

    pub fn is_expired(&self, ttl_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > ttl_seconds
    }
}

/// Stable, revision-independent flow identity used as a graph-topology
/// key. Equality and hashing go through `uid` only; `namespace` and `id`
/// are display fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub uid: String,
    pub tenant_id: String,
    pub namespace: String,
    pub id: String,
}

impl FlowNode {
    pub fn new(
        tenant_id: impl Into<String>,
        namespace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let namespace = namespace.into();
        let id = id.into();
        Self {
            uid: format!("{tenant_id}_{namespace}_{id}"),
            tenant_id,
            namespace,
            id,
        }
    }
}

impl PartialEq for FlowNode {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for FlowNode {}

impl Hash for FlowNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_flow() -> FlowNode {
        FlowNode::new("main", "company.team", "daily-report")
    }

    #[test]
    fn test_envelope_round_trip() {
        let job = WorkerJob::task(
            "main",
            "exec-1",
            sample_flow(),
            "extract",
            json!({"url": "https://example.com"}),
        );
        let envelope = job.to_envelope().unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(restored, envelope);
        let decoded: WorkerJob = restored.decode().unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_envelope_rejects_empty_tenant() {
        let key = TenantScopedKey::new("");
        let err = Envelope::new(key, &json!({"x": 1})).unwrap_err();
        assert!(matches!(err, CoordinatorError::Queue(_)));
    }

    #[test]
    fn test_envelope_typed_decode_failure_is_deserialization() {
        let envelope = Envelope::new(TenantScopedKey::new("main"), &json!({"not": "a job"}))
            .unwrap();
        let err = envelope.decode::<WorkerJob>().unwrap_err();
        assert!(matches!(err, CoordinatorError::Deserialization(_)));
    }

    #[test]
    fn test_worker_job_group_affinity_on_key() {
        let job = WorkerJob::task("main", "exec-1", sample_flow(), "t1", json!({}))
            .with_worker_group("docker");
        let envelope = job.to_envelope().unwrap();
        assert_eq!(envelope.key.partition_key.as_deref(), Some("docker"));

        let ungrouped = WorkerJob::task("main", "exec-1", sample_flow(), "t1", json!({}));
        assert!(ungrouped.to_envelope().unwrap().key.partition_key.is_none());
    }

    #[test]
    fn test_next_attempt_keeps_correlation_id() {
        let job = WorkerJob::task("main", "exec-1", sample_flow(), "t1", json!({}));
        let retried = job.next_attempt();
        assert_eq!(retried.job_id, job.job_id);
        assert_eq!(retried.attempt, 1);
    }

    #[test]
    fn test_worker_result_mirrors_job_kind() {
        let task_job = WorkerJob::task("main", "exec-1", sample_flow(), "t1", json!({}));
        assert!(matches!(
            WorkerResult::success(&task_job, None),
            WorkerResult::Task(_)
        ));

        let trigger_job = WorkerJob::trigger("main", "exec-2", sample_flow(), "poll", json!({}));
        let result = WorkerResult::failure(&trigger_job, "endpoint unreachable");
        assert!(matches!(result, WorkerResult::Trigger(_)));
        assert_eq!(result.state(), ResultState::Failed);
        assert_eq!(result.job_id(), trigger_job.job_id);
    }

    #[test]
    fn test_cluster_event_uids_are_unique() {
        let a = ClusterEvent::maintenance_enter("rolling restart");
        let b = ClusterEvent::maintenance_enter("rolling restart");
        assert_ne!(a.uid, b.uid);
        assert_eq!(a.kind, ClusterEventKind::MaintenanceEnter);
    }

    #[test]
    fn test_service_instance_expiry() {
        let mut instance = ServiceInstance::new(ServiceKind::Worker, "host-1");
        let now = Utc::now();
        assert!(!instance.is_expired(60, now));

        instance.last_heartbeat = now - chrono::Duration::seconds(120);
        assert!(instance.is_expired(60, now));
        assert!(!instance.is_expired(300, now));
    }

    #[test]
    fn test_flow_node_equality_by_uid_only() {
        let a = FlowNode::new("main", "company.team", "daily-report");
        let mut b = FlowNode::new("main", "company.team", "daily-report");
        b.namespace = "renamed.display".to_string();
        b.id = "renamed".to_string();
        // uid untouched: still the same node
        assert_eq!(a, b);

        let c = FlowNode::new("main", "company.team", "other-flow");
        assert_ne!(a, c);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
