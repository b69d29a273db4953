//! Dispatcher
//!
//! The single submission API. A submission flows: idempotency
//! short-circuit → concurrency-guard lock → Pending ledger row → handler
//! resolution → Queued → executor. Outcomes come back on the update
//! channel; the completion loop applies the retry policy, settles the
//! run, and releases the lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use girder_core::{
    DeadLetter, HandlerRegistry, Params, RetryDecision, RetryPolicy, Run, RunEventType, RunId,
    RunStatus, WorkError, WorkSpec,
};
use girder_storage::{DlqFilter, ExecutionStore, RunFilter, StoreError, TransitionCtx};

use crate::breaker::{BreakerRegistry, CircuitBreakerConfig};
use crate::executor::{ExecutionUpdate, Executor, UpdateRx, UpdateTx, WorkItem};
use crate::guard::ConcurrencyGuard;
use crate::runner::Runnable;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Run-level retry policy when the spec carries none
    pub default_retry: RetryPolicy,

    /// TTL on concurrency-guard locks
    pub lock_ttl: Duration,

    /// How long `submit` waits on a held lock before failing
    pub lock_acquire_timeout: Duration,

    /// Default wait bound for synchronous submissions
    pub sync_wait_timeout: Duration,

    /// When set, a circuit breaker per handler name gates submissions
    pub breaker: Option<CircuitBreakerConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            lock_acquire_timeout: Duration::ZERO,
            sync_wait_timeout: Duration::from_secs(300),
            breaker: None,
        }
    }
}

/// Errors surfaced by dispatcher operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The spec failed validation before submission
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Another submission holds the concurrency lock for this work
    #[error("already running: {key}")]
    AlreadyRunning { key: String },

    /// The circuit breaker for this handler is open
    #[error("circuit open for {name}")]
    CircuitOpen { name: String },

    /// Ledger failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A synchronous wait exceeded its bound
    #[error("timed out waiting for run {run_id}")]
    WaitTimeout { run_id: RunId },
}

impl DispatchError {
    /// Render as a handler-level error for step pipelines
    pub fn to_work_error(&self) -> WorkError {
        match self {
            Self::InvalidSpec(msg) => WorkError::validation(msg.clone()),
            Self::AlreadyRunning { key } => {
                WorkError::transient(format!("already running: {key}"))
            }
            Self::CircuitOpen { name } => {
                WorkError::dependency(format!("circuit open for {name}"))
            }
            Self::Store(e) => WorkError::new(e.to_string(), e.category()),
            Self::WaitTimeout { run_id } => {
                WorkError::timeout(format!("timed out waiting for run {run_id}"))
            }
        }
    }
}

struct Inner {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<dyn Executor>,
    guard: ConcurrencyGuard,
    config: DispatcherConfig,
    breakers: Option<BreakerRegistry>,
    waiters: DashMap<RunId, watch::Sender<RunStatus>>,
    lock_keys: DashMap<RunId, String>,
    last_errors: DashMap<RunId, WorkError>,
    updates: UpdateTx,
}

/// The single public API: submit, query, cancel, list
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<HandlerRegistry>,
        executor: Arc<dyn Executor>,
        config: DispatcherConfig,
    ) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let breakers = config
            .breaker
            .as_ref()
            .map(|cfg| BreakerRegistry::new(cfg.clone()));
        let inner = Arc::new(Inner {
            guard: ConcurrencyGuard::new(store.clone()),
            store,
            registry,
            executor,
            config,
            breakers,
            waiters: DashMap::new(),
            lock_keys: DashMap::new(),
            last_errors: DashMap::new(),
            updates: tx,
        });
        tokio::spawn(Inner::completion_loop(inner.clone(), rx));
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    /// Generic submission; returns the run id immediately
    pub async fn submit(&self, spec: WorkSpec) -> Result<RunId, DispatchError> {
        self.submit_with_parent(spec, None).await
    }

    /// Submission with a parent link for workflow sub-runs
    #[instrument(skip(self, spec), fields(kind = %spec.kind, name = %spec.name))]
    pub async fn submit_with_parent(
        &self,
        spec: WorkSpec,
        parent: Option<RunId>,
    ) -> Result<RunId, DispatchError> {
        let inner = &self.inner;
        if spec.name.is_empty() {
            return Err(DispatchError::InvalidSpec("empty handler name".to_string()));
        }

        // Idempotency short-circuit: a completed run under the same key is
        // returned silently.
        if let Some(key) = &spec.idempotency_key {
            if let Some(prior) = inner.store.get_by_idempotency_key(key).await? {
                debug!(run_id = %prior.run_id, key, "idempotency short-circuit");
                return Ok(prior.run_id);
            }
        }

        if let Some(breakers) = &inner.breakers {
            if !breakers.get(&spec.name).allow_request() {
                return Err(DispatchError::CircuitOpen {
                    name: spec.name.clone(),
                });
            }
        }

        let run_id = RunId::generate();
        let lock_key = spec.lock_key();
        let acquired = inner
            .guard
            .acquire(
                &lock_key,
                run_id,
                inner.config.lock_ttl,
                inner.config.lock_acquire_timeout,
            )
            .await?;
        if !acquired {
            return Err(DispatchError::AlreadyRunning { key: lock_key });
        }
        inner.lock_keys.insert(run_id, lock_key.clone());

        let run = match inner.store.create_run(run_id, &spec, parent).await {
            Ok(run) => run,
            Err(e) => {
                inner.lock_keys.remove(&run_id);
                let _ = inner.guard.release(&lock_key, run_id).await;
                return Err(e.into());
            }
        };
        if run.run_id != run_id {
            // An existing non-terminal run under this idempotency key won
            // the race; fold onto it.
            inner.lock_keys.remove(&run_id);
            let _ = inner.guard.release(&lock_key, run_id).await;
            return Ok(run.run_id);
        }
        info!(%run_id, "accepted submission");

        let Some(handler) = inner.registry.get(spec.kind, &spec.name) else {
            Inner::fail_unroutable(inner, run_id, &spec).await;
            return Ok(run_id);
        };

        Inner::dispatch(inner, run_id, spec, handler, 1).await;
        Ok(run_id)
    }

    pub async fn submit_task(
        &self,
        name: impl Into<String>,
        params: Params,
    ) -> Result<RunId, DispatchError> {
        self.submit(WorkSpec::task(name, params)).await
    }

    pub async fn submit_operation(
        &self,
        name: impl Into<String>,
        params: Params,
    ) -> Result<RunId, DispatchError> {
        self.submit(WorkSpec::operation(name, params)).await
    }

    pub async fn submit_workflow(
        &self,
        name: impl Into<String>,
        params: Params,
    ) -> Result<RunId, DispatchError> {
        self.submit(WorkSpec::workflow(name, params)).await
    }

    /// Submit and block until the run settles
    pub async fn submit_operation_sync(
        &self,
        name: impl Into<String>,
        params: Params,
    ) -> Result<Run, DispatchError> {
        let run_id = self.submit(WorkSpec::operation(name, params)).await?;
        self.wait_for_settled(run_id, self.inner.config.sync_wait_timeout)
            .await
    }

    /// Wait until the run reaches Completed, Cancelled, or DeadLettered
    pub async fn wait_for_settled(
        &self,
        run_id: RunId,
        timeout: Duration,
    ) -> Result<Run, DispatchError> {
        let mut rx = {
            let entry = self
                .inner
                .waiters
                .entry(run_id)
                .or_insert_with(|| watch::channel(RunStatus::Pending).0);
            entry.subscribe()
        };

        // The run may have settled before we subscribed.
        let run = self.inner.store.get_run(run_id).await?;
        if run.status.is_settled() {
            return Ok(run);
        }

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow_and_update().is_settled() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if waited.is_err() {
            return Err(DispatchError::WaitTimeout { run_id });
        }
        Ok(self.inner.store.get_run(run_id).await?)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run, DispatchError> {
        Ok(self.inner.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, DispatchError> {
        Ok(self.inner.store.list_runs(filter).await?)
    }

    pub async fn list_dlq(&self, filter: &DlqFilter) -> Result<Vec<DeadLetter>, DispatchError> {
        Ok(self.inner.store.list_dlq(filter).await?)
    }

    /// Append a PROGRESS event from inside a handler
    pub async fn record_progress(
        &self,
        run_id: RunId,
        data: Value,
    ) -> Result<(), DispatchError> {
        Ok(self
            .inner
            .store
            .record_event(run_id, RunEventType::Progress, Some(data))
            .await?)
    }

    /// Cancel a run in Pending, Queued, or Running.
    ///
    /// Returns false when there is nothing to cancel; a second cancel is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, DispatchError> {
        let inner = &self.inner;
        let run = inner.store.get_run(run_id).await?;
        if !matches!(
            run.status,
            RunStatus::Pending | RunStatus::Queued | RunStatus::Running
        ) {
            return Ok(false);
        }
        match inner
            .store
            .update_status(run_id, RunStatus::Cancelled, TransitionCtx::default())
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if let Some(external_ref) = &run.external_ref {
            if inner.executor.capabilities().supports_cancel {
                if let Err(e) = inner.executor.cancel(external_ref).await {
                    warn!(%run_id, "executor cancel failed: {e}");
                }
            }
        }
        info!(%run_id, "cancelled");
        Inner::settle(inner, run_id, RunStatus::Cancelled).await;
        Ok(true)
    }

    /// Re-queue a dead-lettered run and hand it back to the executor
    pub async fn retry_from_dlq(
        &self,
        dlq_id: Uuid,
        resolved_by: &str,
    ) -> Result<RunId, DispatchError> {
        let inner = &self.inner;
        let run = inner.store.retry_from_dlq(dlq_id, resolved_by).await?;
        let run_id = run.run_id;
        match inner.registry.get(run.spec.kind, &run.spec.name) {
            Some(handler) => {
                let attempt = run.retry_count + 1;
                Inner::dispatch(inner, run_id, run.spec, handler, attempt).await;
            }
            None => Inner::fail_unroutable(inner, run_id, &run.spec).await,
        }
        Ok(run_id)
    }

    /// Stop accepting work and shut the executor down
    pub async fn shutdown(&self, drain: bool) {
        self.inner.executor.shutdown(drain).await;
    }
}

impl Inner {
    /// Hand a prepared run to the executor: Queued first, so executor
    /// updates can never race ahead of the ledger.
    fn dispatch<'a>(
        inner: &'a Arc<Inner>,
        run_id: RunId,
        spec: WorkSpec,
        handler: Arc<dyn girder_core::Handler>,
        attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match inner
                .store
                .update_status(run_id, RunStatus::Queued, TransitionCtx::default())
                .await
            {
                Ok(_) => Self::notify(inner, run_id, RunStatus::Queued),
                Err(StoreError::InvalidTransition(t)) => {
                    debug!(%run_id, "skipping dispatch: {t}");
                    return;
                }
                Err(e) => {
                    error!(%run_id, "failed to queue run: {e}");
                    return;
                }
            }

            let item = WorkItem {
                run_id,
                spec: spec.clone(),
                handler,
                attempt,
                deadline: None,
            };
            match inner.executor.submit(item, inner.updates.clone()).await {
                Ok(Some(external_ref)) => {
                    if let Err(e) = inner.store.set_external_ref(run_id, &external_ref).await {
                        warn!(%run_id, "could not record external ref: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%run_id, "executor rejected submission: {e}");
                    Self::handle_failure(
                        inner,
                        run_id,
                        attempt,
                        WorkError::dependency(format!("executor rejected submission: {e}")),
                    )
                    .await;
                }
            }
        })
    }

    /// Park a run whose handler cannot be resolved
    async fn fail_unroutable(inner: &Arc<Inner>, run_id: RunId, spec: &WorkSpec) {
        let message = format!(
            "HANDLER_NOT_FOUND: no handler registered for {}:{}",
            spec.kind, spec.name
        );
        warn!(%run_id, "{message}");
        for (status, ctx) in [
            (RunStatus::Queued, TransitionCtx::default()),
            (RunStatus::Failed, TransitionCtx::with_error(&message)),
        ] {
            if let Err(e) = inner.store.update_status(run_id, status, ctx).await {
                error!(%run_id, "failed to park unroutable run: {e}");
                return;
            }
        }
        inner
            .last_errors
            .insert(run_id, WorkError::config(message.clone()));
        match inner.store.add_to_dlq(run_id, &message, 0).await {
            Ok(_) => Self::settle(inner, run_id, RunStatus::DeadLettered).await,
            Err(e) => error!(%run_id, "failed to dead-letter unroutable run: {e}"),
        }
    }

    async fn completion_loop(inner: Arc<Inner>, mut rx: UpdateRx) {
        while let Some(update) = rx.recv().await {
            match update {
                ExecutionUpdate::Started { run_id, .. } => {
                    match inner
                        .store
                        .update_status(run_id, RunStatus::Running, TransitionCtx::default())
                        .await
                    {
                        Ok(_) => Self::notify(&inner, run_id, RunStatus::Running),
                        Err(StoreError::InvalidTransition(t)) => {
                            debug!(%run_id, "ignoring start: {t}")
                        }
                        Err(e) => error!(%run_id, "failed to mark running: {e}"),
                    }
                }
                ExecutionUpdate::Finished {
                    run_id,
                    attempt,
                    outcome,
                } => match outcome {
                    Ok(output) => Self::handle_success(&inner, run_id, output).await,
                    Err(err) => Self::handle_failure(&inner, run_id, attempt, err).await,
                },
            }
        }
    }

    async fn handle_success(inner: &Arc<Inner>, run_id: RunId, output: Value) {
        match inner
            .store
            .update_status(run_id, RunStatus::Completed, TransitionCtx::with_output(output))
            .await
        {
            Ok(run) => {
                if let Some(breakers) = &inner.breakers {
                    breakers.get(&run.spec.name).record_success();
                }
                info!(%run_id, "completed");
                Self::settle(inner, run_id, RunStatus::Completed).await;
            }
            Err(StoreError::InvalidTransition(t)) => {
                debug!(%run_id, "ignoring late completion: {t}")
            }
            Err(e) => error!(%run_id, "failed to mark completed: {e}"),
        }
    }

    async fn handle_failure(inner: &Arc<Inner>, run_id: RunId, attempt: u32, err: WorkError) {
        inner.last_errors.insert(run_id, err.clone());

        let run = match inner.store.get_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(%run_id, "failed to load run after failure: {e}");
                return;
            }
        };
        if run.status.is_settled() {
            debug!(%run_id, status = %run.status, "ignoring late failure");
            return;
        }
        if let Some(breakers) = &inner.breakers {
            breakers.get(&run.spec.name).record_failure();
        }

        match inner
            .store
            .update_status(
                run_id,
                RunStatus::Failed,
                TransitionCtx::with_error(&err.message),
            )
            .await
        {
            Ok(_) => Self::notify(inner, run_id, RunStatus::Failed),
            Err(StoreError::InvalidTransition(t)) => {
                debug!(%run_id, "ignoring late failure: {t}");
                return;
            }
            Err(e) => {
                error!(%run_id, "failed to mark failed: {e}");
                return;
            }
        }

        let policy = run
            .spec
            .retry_policy
            .clone()
            .unwrap_or_else(|| inner.config.default_retry.clone());
        match policy.decide(attempt, err.category) {
            RetryDecision::Retry(delay) => {
                let event_data = serde_json::json!({
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "error": err.message,
                });
                match inner
                    .store
                    .update_status(
                        run_id,
                        RunStatus::Pending,
                        TransitionCtx::default().with_event_data(event_data),
                    )
                    .await
                {
                    Ok(_) => {
                        Self::notify(inner, run_id, RunStatus::Pending);
                        info!(%run_id, attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
                        let inner = inner.clone();
                        let spec = run.spec.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            Self::resubmit(&inner, run_id, spec, attempt + 1).await;
                        });
                    }
                    Err(e) => error!(%run_id, "failed to re-enter pending: {e}"),
                }
            }
            RetryDecision::Stop => {
                match inner
                    .store
                    .add_to_dlq(run_id, &err.message, run.retry_count)
                    .await
                {
                    Ok(_) => {
                        warn!(%run_id, retries = run.retry_count, "dead-lettered");
                        Self::settle(inner, run_id, RunStatus::DeadLettered).await;
                    }
                    Err(e) => error!(%run_id, "failed to dead-letter: {e}"),
                }
            }
        }
    }

    /// Re-dispatch a retry if the run is still Pending (a cancel may have
    /// landed during the backoff sleep)
    async fn resubmit(inner: &Arc<Inner>, run_id: RunId, spec: WorkSpec, attempt: u32) {
        match inner.store.get_run(run_id).await {
            Ok(run) if run.status == RunStatus::Pending => {
                match inner.registry.get(spec.kind, &spec.name) {
                    Some(handler) => Self::dispatch(inner, run_id, spec, handler, attempt).await,
                    None => Self::fail_unroutable(inner, run_id, &spec).await,
                }
            }
            Ok(run) => debug!(%run_id, status = %run.status, "skipping retry"),
            Err(e) => error!(%run_id, "failed to load run for retry: {e}"),
        }
    }

    /// Release the concurrency lock and wake waiters on a settled status
    async fn settle(inner: &Arc<Inner>, run_id: RunId, status: RunStatus) {
        if let Some((_, key)) = inner.lock_keys.remove(&run_id) {
            if let Err(e) = inner.guard.release(&key, run_id).await {
                warn!(%run_id, "failed to release lock {key}: {e}");
            }
        }
        Self::notify(inner, run_id, status);
        if status.is_settled() {
            inner.waiters.remove(&run_id);
        }
    }

    fn notify(inner: &Arc<Inner>, run_id: RunId, status: RunStatus) {
        if let Some(tx) = inner.waiters.get(&run_id) {
            let _ = tx.send(status);
        }
    }
}

#[async_trait::async_trait]
impl Runnable for Dispatcher {
    async fn run_operation(
        &self,
        name: &str,
        params: Params,
        parent: RunId,
    ) -> Result<Value, WorkError> {
        let spec = WorkSpec::operation(name, params);
        let run_id = self
            .submit_with_parent(spec, Some(parent))
            .await
            .map_err(|e| e.to_work_error())?;
        let run = self
            .wait_for_settled(run_id, self.inner.config.sync_wait_timeout)
            .await
            .map_err(|e| e.to_work_error())?;
        match run.status {
            RunStatus::Completed => Ok(run.output.unwrap_or(Value::Null)),
            status => {
                let err = self
                    .inner
                    .last_errors
                    .remove(&run_id)
                    .map(|(_, e)| e)
                    .unwrap_or_else(|| {
                        WorkError::unknown(
                            run.error
                                .unwrap_or_else(|| format!("run {run_id} ended {status}")),
                        )
                    });
                Err(err)
            }
        }
    }
}
