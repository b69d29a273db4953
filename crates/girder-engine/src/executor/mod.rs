//! Executor protocol
//!
//! An executor is the backend that actually runs handlers: inline, on a
//! blocking pool, as cooperative tasks, in child processes, or via an
//! external broker. Executors never touch the ledger; they report
//! progress through an update channel and the dispatcher owns all status
//! writes.

mod broker;
mod local;
mod memory;
mod process;
mod stub;

pub use broker::{BrokerClient, BrokerExecutor};
pub use local::{AsyncLocalExecutor, LocalExecutor};
pub use memory::MemoryExecutor;
pub use process::ProcessExecutor;
pub use stub::StubExecutor;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use girder_core::{Handler, RunId, RunStatus, WorkError, WorkSpec};

use crate::deadline::Deadline;

/// A unit of work prepared by the dispatcher: the spec plus its resolved
/// handler and attempt bookkeeping.
#[derive(Clone)]
pub struct WorkItem {
    pub run_id: RunId,
    pub spec: WorkSpec,
    pub handler: Arc<dyn Handler>,
    /// 1-based attempt number
    pub attempt: u32,
    pub deadline: Option<Deadline>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("run_id", &self.run_id)
            .field("kind", &self.spec.kind)
            .field("name", &self.spec.name)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Progress reported by executors back to the dispatcher
#[derive(Debug)]
pub enum ExecutionUpdate {
    /// A handler began executing
    Started { run_id: RunId, attempt: u32 },

    /// A handler finished (either way)
    Finished {
        run_id: RunId,
        attempt: u32,
        outcome: Result<Value, WorkError>,
    },
}

/// Sender half of the dispatcher's update channel
pub type UpdateTx = mpsc::UnboundedSender<ExecutionUpdate>;

/// Receiver half, consumed by the dispatcher's completion loop
pub type UpdateRx = mpsc::UnboundedReceiver<ExecutionUpdate>;

/// Static description of what an executor supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorCapabilities {
    /// Whether `cancel` can stop submitted work
    pub supports_cancel: bool,

    /// Whether `get_status` is meaningful (the reconciler polls it)
    pub supports_status_poll: bool,

    /// Concurrent executions the backend allows, when bounded
    pub concurrency_limit: Option<usize>,
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The backend refused the submission
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// The executor is draining and accepts no new work
    #[error("executor is shutting down")]
    ShuttingDown,

    /// Backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Backend-agnostic execution protocol
///
/// `submit` must not block longer than the time to enqueue; execution
/// outcomes flow back through the update channel (or, for backends that
/// cannot call back, through reconciler polling of `get_status`).
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Begin execution; returns the backend's handle when it has one
    async fn submit(
        &self,
        item: WorkItem,
        updates: UpdateTx,
    ) -> Result<Option<String>, ExecutorError>;

    /// Observed status for a previously returned handle
    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError> {
        let _ = external_ref;
        Ok(None)
    }

    /// Request cancellation; best-effort for external backends
    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError>;

    /// Stop accepting work; with `drain`, wait for in-flight executions
    async fn shutdown(&self, drain: bool);

    fn capabilities(&self) -> ExecutorCapabilities;

    /// Handles the backend currently knows about; `None` when the backend
    /// cannot enumerate (orphan detection is skipped)
    async fn list_active(&self) -> Option<Vec<String>> {
        None
    }
}

/// Time budget for one attempt: the tighter of the spec timeout and the
/// caller deadline. Errors immediately if the deadline already passed.
pub(crate) fn attempt_budget(item: &WorkItem) -> Result<Option<std::time::Duration>, WorkError> {
    let effective = Deadline::earliest(item.deadline, item.spec.timeout().map(Deadline::after));
    match effective {
        None => Ok(None),
        Some(deadline) => deadline
            .remaining()
            .map(Some)
            .ok_or_else(|| WorkError::timeout(format!("deadline exceeded before {}", item.spec.name))),
    }
}

/// Run the item's handler under its time budget
pub(crate) async fn run_handler(item: &WorkItem) -> Result<Value, WorkError> {
    let params = item.spec.params.clone();
    match attempt_budget(item)? {
        None => item.handler.call(params).await,
        Some(budget) => match tokio::time::timeout(budget, item.handler.call(params)).await {
            Ok(result) => result,
            Err(_) => Err(WorkError::timeout(format!(
                "handler {} exceeded its {}ms budget",
                item.spec.name,
                budget.as_millis()
            ))),
        },
    }
}
