//! Worker-job dispatch: hands jobs to the queue, correlates results back
//! by job id, and decides the fate of jobs whose worker went away.

pub mod abandonment;
pub mod job_dispatcher;
pub mod result_listener;

pub use abandonment::{AbandonmentDetector, BoundedBackoff, RetryDecision, RetryPolicy};
pub use job_dispatcher::{DispatchState, ExecutionSink, JobDispatcher};
pub use result_listener::ResultListener;
