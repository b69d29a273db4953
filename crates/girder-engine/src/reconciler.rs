//! Reconciler
//!
//! Periodically aligns recorded run state with what an out-of-process
//! backend (broker, container runtime) actually observes. One engine
//! instance reconciles at a time, coordinated through a global lease on
//! the concurrency guard. Startup recovery marks runs orphaned by a
//! crash.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use girder_core::{RunEventType, RunId, RunStatus};
use girder_storage::{ExecutionStore, RunFilter, StoreError, TransitionCtx};

use crate::executor::Executor;
use crate::guard::ConcurrencyGuard;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between reconciliation cycles
    pub poll_interval: Duration,

    /// TTL on the global reconciliation lease
    pub lease_ttl: Duration,

    /// Lock key for the global lease
    pub lease_key: String,

    /// Whether backend handles unknown to the ledger are cancelled
    pub cleanup_orphans: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            lease_key: "girder:reconciler".to_string(),
            cleanup_orphans: false,
        }
    }
}

/// What one reconciliation cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Cycle skipped because another instance holds the lease
    pub skipped: bool,

    /// Runs whose observed state was applied to the ledger
    pub reconciled: u32,

    /// Runs observed and heartbeat-stamped without a state change
    pub observed: u32,

    /// Backend handles with no ledger run
    pub backend_orphans: u32,
}

/// Aligns ledger state with executor-observed state
pub struct Reconciler {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn Executor>,
    guard: ConcurrencyGuard,
    config: ReconcilerConfig,
    /// Lease owner identity for this reconciler instance
    id: RunId,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        executor: Arc<dyn Executor>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store.clone()),
            store,
            executor,
            config,
            id: RunId::generate(),
        }
    }

    /// Run cycles until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!("reconciliation cycle failed: {e}");
                    }
                }
            }
        }
    }

    /// One reconciliation cycle under the global lease
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        let acquired = self
            .guard
            .acquire(
                &self.config.lease_key,
                self.id,
                self.config.lease_ttl,
                Duration::ZERO,
            )
            .await?;
        if !acquired {
            debug!("another instance holds the reconciliation lease");
            report.skipped = true;
            return Ok(report);
        }

        let result = self.reconcile_running_runs(&mut report).await;
        let _ = self.guard.release(&self.config.lease_key, self.id).await;
        result?;
        Ok(report)
    }

    async fn reconcile_running_runs(
        &self,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        if !self.executor.capabilities().supports_status_poll {
            return Ok(());
        }

        let running = self
            .store
            .list_runs(&RunFilter::default().with_status(RunStatus::Running))
            .await?;
        let mut known_refs: Vec<String> = Vec::with_capacity(running.len());

        for run in &running {
            let Some(external_ref) = &run.external_ref else {
                continue;
            };
            known_refs.push(external_ref.clone());

            let observed = match self.executor.get_status(external_ref).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(run_id = %run.run_id, "status poll failed: {e}");
                    continue;
                }
            };
            self.store.heartbeat(run.run_id).await?;
            report.observed += 1;

            let Some(observed) = observed else { continue };
            if observed == run.status {
                continue;
            }

            self.store
                .record_event(
                    run.run_id,
                    RunEventType::Reconciled,
                    Some(json!({
                        "recorded": run.status,
                        "observed": observed,
                    })),
                )
                .await?;
            match self
                .store
                .update_status(run.run_id, observed, TransitionCtx::default())
                .await
            {
                Ok(_) => {
                    info!(run_id = %run.run_id, from = %run.status, to = %observed, "reconciled run");
                    report.reconciled += 1;
                }
                Err(StoreError::InvalidTransition(t)) => {
                    warn!(run_id = %run.run_id, "cannot apply observed state: {t}");
                }
                Err(e) => return Err(e),
            }
        }

        // Backend-side orphans: handles the backend reports that no
        // ledger run claims.
        if let Some(active) = self.executor.list_active().await {
            for external_ref in active {
                if known_refs.contains(&external_ref) {
                    continue;
                }
                report.backend_orphans += 1;
                warn!(external_ref, "backend handle unknown to the ledger");
                if self.config.cleanup_orphans {
                    if let Err(e) = self.executor.cancel(&external_ref).await {
                        warn!(external_ref, "orphan cleanup failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Startup crash recovery: runs stuck in Running from a previous
    /// process life are either reconciled (when a backend handle exists)
    /// or failed with an ORPHANED cause.
    #[instrument(skip(self))]
    pub async fn recover_orphaned(&self) -> Result<u32, StoreError> {
        let running = self
            .store
            .list_runs(&RunFilter::default().with_status(RunStatus::Running))
            .await?;
        let can_poll = self.executor.capabilities().supports_status_poll;
        let mut recovered = 0;

        for run in running {
            let observed = match &run.external_ref {
                Some(external_ref) if can_poll => {
                    self.executor.get_status(external_ref).await.ok().flatten()
                }
                _ => None,
            };
            match observed {
                Some(status) if status != RunStatus::Running => {
                    self.store
                        .record_event(
                            run.run_id,
                            RunEventType::Reconciled,
                            Some(json!({ "recorded": run.status, "observed": status })),
                        )
                        .await?;
                    match self
                        .store
                        .update_status(run.run_id, status, TransitionCtx::default())
                        .await
                    {
                        Ok(_) => recovered += 1,
                        Err(StoreError::InvalidTransition(t)) => {
                            warn!(run_id = %run.run_id, "recovery transition rejected: {t}")
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(_) => {}
                None => {
                    self.store
                        .record_event(
                            run.run_id,
                            RunEventType::OrphanDetected,
                            Some(json!({ "external_ref": run.external_ref })),
                        )
                        .await?;
                    self.store
                        .update_status(
                            run.run_id,
                            RunStatus::Failed,
                            TransitionCtx::with_error("ORPHANED: run lost by a previous process"),
                        )
                        .await?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered orphaned runs");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BrokerClient, BrokerExecutor, ExecutorError, StubExecutor, WorkItem};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use girder_core::{Params, WorkSpec};
    use girder_storage::MemoryStore;

    struct ScriptedBroker {
        statuses: DashMap<String, RunStatus>,
        active: Vec<String>,
    }

    #[async_trait]
    impl BrokerClient for ScriptedBroker {
        async fn enqueue(&self, item: &WorkItem) -> Result<String, ExecutorError> {
            Ok(format!("task-{}", item.run_id))
        }

        async fn status(&self, task_id: &str) -> Result<Option<RunStatus>, ExecutorError> {
            Ok(self.statuses.get(task_id).map(|s| *s))
        }

        async fn cancel(&self, _task_id: &str) -> Result<bool, ExecutorError> {
            Ok(true)
        }

        async fn active_tasks(&self) -> Result<Vec<String>, ExecutorError> {
            Ok(self.active.clone())
        }
    }

    async fn running_run(store: &MemoryStore, external_ref: Option<&str>) -> RunId {
        let run_id = RunId::generate();
        store
            .create_run(run_id, &WorkSpec::task("remote", Params::new()), None)
            .await
            .unwrap();
        store
            .update_status(run_id, RunStatus::Running, TransitionCtx::default())
            .await
            .unwrap();
        if let Some(external_ref) = external_ref {
            store.set_external_ref(run_id, external_ref).await.unwrap();
        }
        run_id
    }

    #[tokio::test]
    async fn test_reconcile_applies_observed_completion() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker {
            statuses: DashMap::new(),
            active: vec![],
        });
        let run_id = running_run(&store, Some("task-1")).await;
        broker.statuses.insert("task-1".to_string(), RunStatus::Completed);

        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(BrokerExecutor::new(broker)),
            ReconcilerConfig::default(),
        );
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.reconciled, 1);

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.last_heartbeat_at.is_some());

        let events = store.load_events(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == RunEventType::Reconciled));
    }

    #[tokio::test]
    async fn test_backend_orphans_are_counted() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(ScriptedBroker {
            statuses: DashMap::new(),
            active: vec!["ghost-task".to_string()],
        });

        let reconciler = Reconciler::new(
            store,
            Arc::new(BrokerExecutor::new(broker)),
            ReconcilerConfig::default(),
        );
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.backend_orphans, 1);
    }

    #[tokio::test]
    async fn test_recover_orphaned_without_ref_fails_run() {
        let store = Arc::new(MemoryStore::new());
        let run_id = running_run(&store, None).await;

        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(StubExecutor::new()),
            ReconcilerConfig::default(),
        );
        let recovered = reconciler.recover_orphaned().await.unwrap();
        assert_eq!(recovered, 1);

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().starts_with("ORPHANED"));

        let events = store.load_events(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == RunEventType::OrphanDetected));
    }

    #[tokio::test]
    async fn test_lease_prevents_concurrent_cycles() {
        let store = Arc::new(MemoryStore::new());
        let config = ReconcilerConfig::default();

        // Another instance holds the lease.
        let holder = ConcurrencyGuard::new(store.clone());
        assert!(holder
            .acquire(&config.lease_key, RunId::generate(), config.lease_ttl, Duration::ZERO)
            .await
            .unwrap());

        let reconciler = Reconciler::new(store, Arc::new(StubExecutor::new()), config);
        let report = reconciler.reconcile_once().await.unwrap();
        assert!(report.skipped);
    }
}
