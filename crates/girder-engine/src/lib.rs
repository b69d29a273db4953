//! # Girder execution engine
//!
//! The runtime backbone for data-intensive workflow orchestration:
//! declarative workflows run on pluggable compute backends, with every
//! state transition recorded in the durable ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │   (submit / query / cancel; owns retries and the lock)      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      ExecutionStore      │   │          Executor            │
//! │ (runs, events, DLQ,      │   │ (memory / thread pool /      │
//! │  locks, manifest)        │   │  async pool / process /      │
//! └──────────────────────────┘   │  broker / stub)              │
//!            ▲                   └──────────────────────────────┘
//!            │                                   │
//! ┌──────────────────────────┐                   │
//! │     WorkflowRunner       │◄──────────────────┘
//! │ (sequential / parallel   │      (operation steps go back
//! │  DAG, tracked resume)    │       through the dispatcher)
//! └──────────────────────────┘
//! ```
//!
//! The reconciler closes the loop for out-of-process backends by polling
//! observed state and applying it to the ledger.
//!
//! ## Example
//!
//! ```ignore
//! use girder_engine::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_task("echo", handler_fn(|p| Ok(json!({ "echo": p.get("x") }))))?;
//!
//! let dispatcher = Dispatcher::new(
//!     store,
//!     registry,
//!     Arc::new(AsyncLocalExecutor::new(8)),
//!     DispatcherConfig::default(),
//! );
//! let run_id = dispatcher.submit_task("echo", params([("x", json!(42))])).await?;
//! ```

pub mod breaker;
pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod executor;
pub mod guard;
pub mod rate_limit;
pub mod reconciler;
pub mod retry;
pub mod runner;

/// Prelude for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use girder_core::{
        async_handler_fn, handler_fn, params, ContainerJobSpec, ErrorCategory, Handler,
        HandlerRegistry, Params, RetryPolicy, Run, RunId, RunStatus, WorkError, WorkKind,
        WorkSpec,
    };
    pub use girder_core::workflow::{
        ErrorPolicy, ExecutionMode, Step, StepResult, Workflow, WorkflowResult, WorkflowStatus,
    };
    pub use girder_storage::{ExecutionStore, MemoryStore, PostgresStore, RunFilter};

    pub use crate::breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::config::{EngineConfig, ExecutorKind};
    pub use crate::deadline::Deadline;
    pub use crate::dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
    pub use crate::executor::{
        AsyncLocalExecutor, BrokerClient, BrokerExecutor, Executor, LocalExecutor, MemoryExecutor,
        ProcessExecutor, StubExecutor,
    };
    pub use crate::guard::ConcurrencyGuard;
    pub use crate::rate_limit::{
        CompositeRateLimiter, KeyedRateLimiter, RateLimiter, SlidingWindow, TokenBucket,
    };
    pub use crate::reconciler::{Reconciler, ReconcilerConfig};
    pub use crate::retry::{with_retry, with_retry_policy};
    pub use crate::runner::direct::DirectRunnable;
    pub use crate::runner::tracked::TrackedWorkflowRunner;
    pub use crate::runner::{register_workflow, Runnable, RunnerConfig, WorkflowRunner};
}

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ConfigError, EngineConfig, ExecutorKind};
pub use deadline::Deadline;
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
pub use executor::{
    AsyncLocalExecutor, BrokerClient, BrokerExecutor, ExecutionUpdate, Executor,
    ExecutorCapabilities, ExecutorError, LocalExecutor, MemoryExecutor, ProcessExecutor,
    StubExecutor, WorkItem,
};
pub use guard::ConcurrencyGuard;
pub use rate_limit::{
    CompositeRateLimiter, KeyedRateLimiter, RateLimiter, SlidingWindow, TokenBucket,
};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use retry::{with_retry, with_retry_policy};
pub use runner::direct::DirectRunnable;
pub use runner::tracked::TrackedWorkflowRunner;
pub use runner::{register_workflow, Runnable, RunnerConfig, WorkflowRunner};
