//! Inline executor for tests

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use girder_core::{RunStatus, WorkError};

use super::{
    run_handler, ExecutionUpdate, Executor, ExecutorCapabilities, ExecutorError, UpdateTx,
    WorkItem,
};

/// Runs the handler synchronously in the submitter's task and keeps the
/// result in memory. Intended for tests.
pub struct MemoryExecutor {
    results: DashMap<String, Result<Value, WorkError>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
        }
    }

    /// Stored outcome for a handle, if execution finished
    pub fn result(&self, external_ref: &str) -> Option<Result<Value, WorkError>> {
        self.results.get(external_ref).map(|r| r.clone())
    }

    pub fn executed_count(&self) -> usize {
        self.results.len()
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn submit(
        &self,
        item: WorkItem,
        updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        let external_ref = item.run_id.to_string();
        let _ = updates.send(ExecutionUpdate::Started {
            run_id: item.run_id,
            attempt: item.attempt,
        });

        let outcome = run_handler(&item).await;
        self.results.insert(external_ref.clone(), outcome.clone());

        let _ = updates.send(ExecutionUpdate::Finished {
            run_id: item.run_id,
            attempt: item.attempt,
            outcome,
        });
        Ok(Some(external_ref))
    }

    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError> {
        Ok(self.results.get(external_ref).map(|r| match r.value() {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        }))
    }

    async fn cancel(&self, _external_ref: &str) -> Result<bool, ExecutorError> {
        // Inline execution has already finished by the time anyone asks.
        Ok(false)
    }

    async fn shutdown(&self, _drain: bool) {}

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: false,
            supports_status_poll: true,
            concurrency_limit: Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::{handler_fn, Params, RunId, WorkSpec};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_inline_execution_reports_both_updates() {
        let executor = MemoryExecutor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run_id = RunId::generate();

        let item = WorkItem {
            run_id,
            spec: WorkSpec::task("echo", Params::new()),
            handler: handler_fn(|_| Ok(json!({"ok": true}))),
            attempt: 1,
            deadline: None,
        };

        let external_ref = executor.submit(item, tx).await.unwrap().unwrap();
        assert_eq!(external_ref, run_id.to_string());

        assert!(matches!(
            rx.recv().await,
            Some(ExecutionUpdate::Started { .. })
        ));
        match rx.recv().await {
            Some(ExecutionUpdate::Finished { outcome, .. }) => {
                assert_eq!(outcome.unwrap(), json!({"ok": true}));
            }
            other => panic!("unexpected update: {other:?}"),
        }

        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(RunStatus::Completed)
        );
    }
}
