use async_trait::async_trait;
use serde_json::Value;

use conductor_domain::{WorkerJob, WorkerJobKind};
use conductor_errors::CoordinatorResult;

/// Runs the business payload of a job. Task and trigger semantics live
/// behind this trait; the service only cares about the outcome.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &WorkerJob) -> CoordinatorResult<Value>;
}

/// Executor for embedded deployments and tests: completes every job
/// immediately, echoing its input as output.
pub struct InlineExecutor;

#[async_trait]
impl JobExecutor for InlineExecutor {
    async fn execute(&self, job: &WorkerJob) -> CoordinatorResult<Value> {
        let input = match &job.kind {
            WorkerJobKind::Task { input, .. } => input,
            WorkerJobKind::Trigger { input, .. } => input,
        };
        Ok(input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_domain::FlowNode;

    #[tokio::test]
    async fn test_inline_executor_echoes_input() {
        let job = WorkerJob::task(
            "main",
            "exec-1",
            FlowNode::new("main", "prod", "flow"),
            "t1",
            serde_json::json!({ "k": "v" }),
        );
        let output = InlineExecutor.execute(&job).await.unwrap();
        assert_eq!(output, serde_json::json!({ "k": "v" }));
    }
}
