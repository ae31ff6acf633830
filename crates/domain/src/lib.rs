pub mod entities;
pub mod messaging;
pub mod tenant;

pub use entities::{
    ClusterEvent, ClusterEventKind, Envelope, FlowNode, ResultState, ServiceInstance, ServiceKind,
    ServiceState, TenantScopedKey, WorkerJob, WorkerJobKind, WorkerResult, WorkerTaskResult,
    WorkerTriggerResult,
};
pub use messaging::{
    handler_fn, CoordinationQueue, Delivery, DeliveryHandler, MalformedEnvelope, PauseGate,
    Subscription,
};
pub use tenant::{SingleTenantResolver, TenantResolver, MAIN_TENANT};

pub use conductor_errors::{CoordinatorError, CoordinatorResult};

/// Logical queue names shared by producers and consumers. Transports
/// namespace the physical topic/table key by tenant on top of these.
pub mod queues {
    /// Executable task/trigger jobs routed to workers.
    pub const WORKER_JOB: &str = "worker-job";
    /// Task and trigger results routed back to the owning executor.
    pub const WORKER_RESULT: &str = "worker-result";
    /// Broadcast cluster events (maintenance enter/exit).
    pub const CLUSTER_EVENT: &str = "cluster-event";
    /// Service instance heartbeats feeding the membership view.
    pub const SERVICE_HEARTBEAT: &str = "service-heartbeat";

    /// Control-plane queues are exempt from the pause gate: a drained
    /// process must still observe the maintenance-exit event and keep
    /// heartbeating its own state.
    pub fn is_control(queue: &str) -> bool {
        queue == CLUSTER_EVENT || queue == SERVICE_HEARTBEAT
    }
}
