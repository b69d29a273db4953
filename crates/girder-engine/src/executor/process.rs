//! Child-process executor
//!
//! Runs each work item as one invocation of a configured command: the
//! item is written to the child's stdin as JSON, the child's stdout is
//! parsed as the JSON result, and a non-zero exit fails the attempt.
//! Intended for CPU-bound handlers that should not share the engine
//! process.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use girder_core::WorkError;

use super::{
    attempt_budget, ExecutionUpdate, Executor, ExecutorCapabilities, ExecutorError, UpdateTx,
    WorkItem,
};

/// Bounded pool of child processes
pub struct ProcessExecutor {
    command: Vec<String>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancels: Arc<DashMap<String, CancellationToken>>,
    shutting_down: AtomicBool,
    max_processes: usize,
}

impl ProcessExecutor {
    /// `command` is the program plus fixed arguments; it must read one
    /// JSON object from stdin and write one JSON value to stdout.
    pub fn new(command: Vec<String>, max_processes: usize) -> Result<Self, ExecutorError> {
        if command.is_empty() {
            return Err(ExecutorError::Rejected(
                "process executor requires a command".to_string(),
            ));
        }
        let max_processes = max_processes.max(1);
        Ok(Self {
            command,
            semaphore: Arc::new(Semaphore::new(max_processes)),
            tracker: TaskTracker::new(),
            cancels: Arc::new(DashMap::new()),
            shutting_down: AtomicBool::new(false),
            max_processes,
        })
    }

    async fn run_child(
        command: &[String],
        item: &WorkItem,
    ) -> Result<Value, WorkError> {
        let budget = attempt_budget(item)?;

        let payload = serde_json::json!({
            "run_id": item.run_id,
            "kind": item.spec.kind,
            "name": item.spec.name,
            "params": item.spec.params,
            "attempt": item.attempt,
        });
        let input =
            serde_json::to_vec(&payload).map_err(|e| WorkError::internal(e.to_string()))?;

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkError::dependency(format!("spawn {}: {e}", command[0])))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| WorkError::dependency(format!("write stdin: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| WorkError::dependency(format!("close stdin: {e}")))?;
        }

        let wait = child.wait_with_output();
        let output = match budget {
            None => wait.await,
            Some(budget) => match tokio::time::timeout(budget, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(WorkError::timeout(format!(
                        "child process for {} exceeded its {}ms budget",
                        item.spec.name,
                        budget.as_millis()
                    )))
                }
            },
        }
        .map_err(|e| WorkError::dependency(format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkError::internal(format!(
                "child exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| WorkError::internal(format!("child produced invalid JSON: {e}")))
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn submit(
        &self,
        item: WorkItem,
        updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShuttingDown);
        }
        let external_ref = item.run_id.to_string();
        let token = CancellationToken::new();
        self.cancels.insert(external_ref.clone(), token.clone());

        let command = self.command.clone();
        let semaphore = self.semaphore.clone();
        let cancels = self.cancels.clone();
        let key = external_ref.clone();

        self.tracker.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if token.is_cancelled() {
                cancels.remove(&key);
                return;
            }
            let _ = updates.send(ExecutionUpdate::Started {
                run_id: item.run_id,
                attempt: item.attempt,
            });

            // kill_on_drop reaps the child if cancellation wins the race.
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    warn!(run_id = %item.run_id, "child process cancelled");
                    None
                }
                result = Self::run_child(&command, &item) => Some(result),
            };

            cancels.remove(&key);
            if let Some(outcome) = outcome {
                let _ = updates.send(ExecutionUpdate::Finished {
                    run_id: item.run_id,
                    attempt: item.attempt,
                    outcome,
                });
            }
        });
        Ok(Some(external_ref))
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError> {
        match self.cancels.get(external_ref) {
            Some(entry) => {
                entry.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shutdown(&self, drain: bool) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.tracker.close();
        if !drain {
            for entry in self.cancels.iter() {
                entry.value().cancel();
            }
        }
        self.tracker.wait().await;
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: true,
            supports_status_poll: false,
            concurrency_limit: Some(self.max_processes),
        }
    }
}
