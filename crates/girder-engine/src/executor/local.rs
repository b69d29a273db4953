//! In-process pool executors
//!
//! Two concurrency shapes over the same bookkeeping:
//!
//! - [`LocalExecutor`] offloads each handler to the blocking thread pool,
//!   for handlers that hold a thread (file I/O, CPU-bound sections).
//! - [`AsyncLocalExecutor`] runs handlers as cooperative tasks bounded by
//!   a semaphore, for handlers that suspend at I/O points.
//!
//! Cancellation is cooperative: a cancelled item is skipped if it has not
//! started, and its result is discarded if it has.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use girder_core::WorkError;

use super::{
    run_handler, ExecutionUpdate, Executor, ExecutorCapabilities, ExecutorError, UpdateTx,
    WorkItem,
};

struct PoolShared {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancels: Arc<DashMap<String, CancellationToken>>,
    shutting_down: AtomicBool,
    limit: usize,
}

impl PoolShared {
    fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            tracker: TaskTracker::new(),
            cancels: Arc::new(DashMap::new()),
            shutting_down: AtomicBool::new(false),
            limit,
        }
    }

    fn check_accepting(&self) -> Result<(), ExecutorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(ExecutorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn register(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels.insert(key.to_string(), token.clone());
        token
    }

    fn cancel(&self, key: &str) -> bool {
        match self.cancels.get(key) {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
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
}

/// Bounded pool for blocking handlers (`max_workers` at a time)
pub struct LocalExecutor {
    shared: PoolShared,
}

impl LocalExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            shared: PoolShared::new(max_workers),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(
        &self,
        item: WorkItem,
        updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        self.shared.check_accepting()?;
        let external_ref = item.run_id.to_string();
        let token = self.shared.register(&external_ref);
        let semaphore = self.shared.semaphore.clone();
        let cancels = self.shared.cancels.clone();
        let key = external_ref.clone();

        self.shared.tracker.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if token.is_cancelled() {
                debug!(run_id = %item.run_id, "cancelled before start");
                cancels.remove(&key);
                return;
            }
            let _ = updates.send(ExecutionUpdate::Started {
                run_id: item.run_id,
                attempt: item.attempt,
            });

            let handle = Handle::current();
            let run_id = item.run_id;
            let attempt = item.attempt;
            let joined =
                tokio::task::spawn_blocking(move || handle.block_on(run_handler(&item))).await;
            let outcome = joined.unwrap_or_else(|e| {
                Err(WorkError::internal(format!("handler panicked: {e}")))
            });

            cancels.remove(&key);
            if !token.is_cancelled() {
                let _ = updates.send(ExecutionUpdate::Finished {
                    run_id,
                    attempt,
                    outcome,
                });
            }
        });
        Ok(Some(external_ref))
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError> {
        Ok(self.shared.cancel(external_ref))
    }

    async fn shutdown(&self, drain: bool) {
        self.shared.shutdown(drain).await;
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: true,
            supports_status_poll: false,
            concurrency_limit: Some(self.shared.limit),
        }
    }
}

/// Cooperative-task executor bounded by a semaphore (`max_concurrency`)
pub struct AsyncLocalExecutor {
    shared: PoolShared,
}

impl AsyncLocalExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            shared: PoolShared::new(max_concurrency),
        }
    }
}

#[async_trait]
impl Executor for AsyncLocalExecutor {
    async fn submit(
        &self,
        item: WorkItem,
        updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError> {
        self.shared.check_accepting()?;
        let external_ref = item.run_id.to_string();
        let token = self.shared.register(&external_ref);
        let semaphore = self.shared.semaphore.clone();
        let cancels = self.shared.cancels.clone();
        let key = external_ref.clone();

        self.shared.tracker.spawn(async move {
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

            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = run_handler(&item) => Some(result),
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
        Ok(self.shared.cancel(external_ref))
    }

    async fn shutdown(&self, drain: bool) {
        self.shared.shutdown(drain).await;
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supports_cancel: true,
            supports_status_poll: false,
            concurrency_limit: Some(self.shared.limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::{async_handler_fn, handler_fn, Params, RunId, WorkSpec};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn item(handler: Arc<dyn girder_core::Handler>) -> WorkItem {
        WorkItem {
            run_id: RunId::generate(),
            spec: WorkSpec::task("t", Params::new()),
            handler,
            attempt: 1,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_local_executor_runs_blocking_handler() {
        let executor = LocalExecutor::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        executor
            .submit(item(handler_fn(|_| Ok(json!(7)))), tx)
            .await
            .unwrap();

        let mut finished = None;
        while let Some(update) = rx.recv().await {
            if let ExecutionUpdate::Finished { outcome, .. } = update {
                finished = Some(outcome);
                break;
            }
        }
        assert_eq!(finished.unwrap().unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_async_executor_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let executor = AsyncLocalExecutor::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let peak = peak.clone();
            let current = current.clone();
            let handler = async_handler_fn(move |_p| {
                let peak = peak.clone();
                let current = current.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            });
            executor.submit(item(handler), tx.clone()).await.unwrap();
        }
        drop(tx);

        let mut finished = 0;
        while let Some(update) = rx.recv().await {
            if matches!(update, ExecutionUpdate::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_execution() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // One worker, first item hogs it while the second is cancelled.
        let executor = AsyncLocalExecutor::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = item(async_handler_fn(|_p| async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(json!("first"))
        }));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let second = item(async_handler_fn(move |_p| {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(json!("second"))
            }
        }));

        executor.submit(first, tx.clone()).await.unwrap();
        let second_ref = executor.submit(second, tx.clone()).await.unwrap().unwrap();
        assert!(executor.cancel(&second_ref).await.unwrap());
        drop(tx);

        let mut finished = 0;
        while let Some(update) = rx.recv().await {
            if matches!(update, ExecutionUpdate::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let executor = LocalExecutor::new(1);
        executor.shutdown(true).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor.submit(item(handler_fn(|_| Ok(json!(null)))), tx).await;
        assert!(matches!(result, Err(ExecutorError::ShuttingDown)));
    }
}
