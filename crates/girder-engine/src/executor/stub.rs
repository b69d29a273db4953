//! No-op executor for dry runs
//!
//! Records what would have been submitted without executing anything, so
//! routing and spec construction can be verified end to end.

use async_trait::async_trait;
use parking_lot::Mutex;

use girder_core::WorkSpec;

use super::{Executor, ExecutorCapabilities, ExecutorError, UpdateTx, WorkItem};

/// Records submissions; never executes
pub struct StubExecutor {
    submitted: Mutex<Vec<WorkSpec>>,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Specs submitted so far, in order
    pub fn submissions(&self) -> Vec<WorkSpec> {
        self.submitted.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl Default for StubExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn submit(
        &self,
        item: WorkItem,
        _updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        let external_ref = format!("stub-{}", item.run_id);
        self.submitted.lock().push(item.spec);
        Ok(Some(external_ref))
    }

    async fn cancel(&self, _external_ref: &str) -> Result<bool, ExecutorError> {
        Ok(false)
    }

    async fn shutdown(&self, _drain: bool) {}

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: false,
            supports_status_poll: false,
            concurrency_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::{handler_fn, params, RunId};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_stub_records_without_executing() {
        let executor = StubExecutor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let item = WorkItem {
            run_id: RunId::generate(),
            spec: WorkSpec::task("dry", params([("x", json!(1))])),
            handler: handler_fn(|_| panic!("stub must not execute handlers")),
            attempt: 1,
            deadline: None,
        };
        let external_ref = executor.submit(item, tx).await.unwrap().unwrap();
        assert!(external_ref.starts_with("stub-"));
        assert_eq!(executor.submission_count(), 1);
        assert_eq!(executor.submissions()[0].name, "dry");

        // No updates are ever produced.
        assert!(rx.try_recv().is_err());
    }
}
