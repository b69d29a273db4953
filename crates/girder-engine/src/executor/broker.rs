//! External-broker executor
//!
//! Dispatches work to an external task broker so long-running or
//! cross-host work can leave the engine process. The broker never calls
//! back; the reconciler polls `get_status` and applies observed
//! transitions to the ledger.

use std::sync::Arc;

use async_trait::async_trait;

use girder_core::RunStatus;

use super::{Executor, ExecutorCapabilities, ExecutorError, UpdateTx, WorkItem};

/// Client for an external task broker
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Enqueue the item; returns the broker's task id
    async fn enqueue(&self, item: &WorkItem) -> Result<String, ExecutorError>;

    /// Observed status of a broker task
    async fn status(&self, task_id: &str) -> Result<Option<RunStatus>, ExecutorError>;

    /// Request cancellation of a broker task
    async fn cancel(&self, task_id: &str) -> Result<bool, ExecutorError>;

    /// Task ids the broker currently knows about, for orphan detection
    async fn active_tasks(&self) -> Result<Vec<String>, ExecutorError> {
        Ok(vec![])
    }
}

/// Executor backed by an external broker client
pub struct BrokerExecutor<C: BrokerClient> {
    client: Arc<C>,
}

impl<C: BrokerClient> BrokerExecutor<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

#[async_trait]
impl<C: BrokerClient> Executor for BrokerExecutor<C> {
    async fn submit(
        &self,
        item: WorkItem,
        _updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        let task_id = self.client.enqueue(&item).await?;
        Ok(Some(task_id))
    }

    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError> {
        self.client.status(external_ref).await
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError> {
        self.client.cancel(external_ref).await
    }

    async fn shutdown(&self, _drain: bool) {
        // In-flight broker tasks outlive this process by design.
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: true,
            supports_status_poll: true,
            concurrency_limit: None,
        }
    }

    async fn list_active(&self) -> Option<Vec<String>> {
        self.client.active_tasks().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use girder_core::{handler_fn, Params, RunId, WorkSpec};
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Test double that records enqueued tasks in memory
    struct FakeBroker {
        tasks: DashMap<String, RunStatus>,
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        async fn enqueue(&self, item: &WorkItem) -> Result<String, ExecutorError> {
            let task_id = format!("broker-{}", item.run_id);
            self.tasks.insert(task_id.clone(), RunStatus::Running);
            Ok(task_id)
        }

        async fn status(&self, task_id: &str) -> Result<Option<RunStatus>, ExecutorError> {
            Ok(self.tasks.get(task_id).map(|s| *s))
        }

        async fn cancel(&self, task_id: &str) -> Result<bool, ExecutorError> {
            Ok(self
                .tasks
                .insert(task_id.to_string(), RunStatus::Cancelled)
                .is_some())
        }
    }

    #[tokio::test]
    async fn test_submit_returns_broker_task_id() {
        let executor = BrokerExecutor::new(Arc::new(FakeBroker {
            tasks: DashMap::new(),
        }));
        let (tx, _rx) = mpsc::unbounded_channel();

        let item = WorkItem {
            run_id: RunId::generate(),
            spec: WorkSpec::task("remote", Params::new()),
            handler: handler_fn(|_| Ok(json!(null))),
            attempt: 1,
            deadline: None,
        };
        let task_id = executor.submit(item, tx).await.unwrap().unwrap();
        assert!(task_id.starts_with("broker-"));

        assert_eq!(
            executor.get_status(&task_id).await.unwrap(),
            Some(RunStatus::Running)
        );
        assert!(executor.cancel(&task_id).await.unwrap());
        assert_eq!(
            executor.get_status(&task_id).await.unwrap(),
            Some(RunStatus::Cancelled)
        );
    }
}
