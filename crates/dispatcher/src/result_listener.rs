use std::sync::Arc;

use tracing::warn;

use conductor_domain::messaging::{CoordinationQueue, Delivery, Subscription};
use conductor_domain::{handler_fn, queues, WorkerResult};
use conductor_errors::CoordinatorResult;

use crate::JobDispatcher;

/// Consumer group under which all dispatching processes compete for
/// results.
pub const RESULT_CONSUMER_GROUP: &str = "dispatcher";

/// Feeds worker results from the queue into the dispatcher's correlation
/// logic.
pub struct ResultListener;

impl ResultListener {
    pub async fn start(
        queue: Arc<dyn CoordinationQueue>,
        tenant_id: &str,
        dispatcher: Arc<JobDispatcher>,
    ) -> CoordinatorResult<Subscription> {
        queue
            .subscribe(
                tenant_id,
                queues::WORKER_RESULT,
                RESULT_CONSUMER_GROUP,
                handler_fn(move |delivery: Delivery| {
                    let dispatcher = Arc::clone(&dispatcher);
                    async move {
                        match delivery {
                            Ok(envelope) => {
                                // a payload that never decodes would be
                                // redelivered forever if left uncommitted
                                let result = match envelope.decode::<WorkerResult>() {
                                    Ok(result) => result,
                                    Err(e) => {
                                        warn!(error = %e, "dropping undecodable worker result");
                                        return Ok(());
                                    }
                                };
                                dispatcher.apply_result(&result).await
                            }
                            Err(malformed) => {
                                warn!(reason = %malformed.reason, "dropping malformed worker result");
                                Ok(())
                            }
                        }
                    }
                }),
            )
            .await
    }
}
