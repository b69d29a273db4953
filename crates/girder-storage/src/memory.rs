//! In-memory implementation of ExecutionStore
//!
//! Primarily for tests and dry runs. Provides the same semantics as the
//! PostgreSQL implementation, including transition validation and the
//! status/event pairing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use girder_core::run::truncate_error;
use girder_core::{
    DeadLetter, Run, RunEvent, RunEventType, RunId, RunStatus, WorkSpec,
};

use crate::store::*;

/// In-memory execution store
///
/// # Example
///
/// ```
/// use girder_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, Run>>,
    events: RwLock<HashMap<RunId, Vec<RunEvent>>>,
    dlq: RwLock<HashMap<Uuid, DeadLetter>>,
    locks: RwLock<HashMap<String, LockRow>>,
    manifest: RwLock<HashMap<(String, String, String, String), ManifestStage>>,
    anomalies: RwLock<Vec<AnomalyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            dlq: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            manifest: RwLock::new(HashMap::new()),
            anomalies: RwLock::new(Vec::new()),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }

    /// All recorded anomalies, for assertions in tests
    pub fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.anomalies.read().clone()
    }

    /// Clear all state (for test isolation)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.events.write().clear();
        self.dlq.write().clear();
        self.locks.write().clear();
        self.manifest.write().clear();
        self.anomalies.write().clear();
    }

    /// Append an event with a timestamp that never regresses within a run
    fn push_event(
        events: &mut HashMap<RunId, Vec<RunEvent>>,
        run_id: RunId,
        event_type: RunEventType,
        data: Option<Value>,
    ) {
        let log = events.entry(run_id).or_default();
        let mut event = RunEvent::new(run_id, event_type, data);
        if let Some(last) = log.last() {
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        }
        log.push(event);
    }

    /// A run this key should fold onto: non-terminal (still in flight) or
    /// Completed (at-most-once completion). Cancelled and dead-lettered
    /// runs do not block a fresh submission.
    fn reusable_run_with_key(runs: &HashMap<RunId, Run>, key: &str) -> Option<Run> {
        runs.values()
            .find(|r| {
                r.idempotency_key.as_deref() == Some(key)
                    && !matches!(r.status, RunStatus::Cancelled | RunStatus::DeadLettered)
            })
            .cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_run(
        &self,
        run_id: RunId,
        spec: &WorkSpec,
        parent_run_id: Option<RunId>,
    ) -> Result<Run, StoreError> {
        let mut runs = self.runs.write();
        let mut events = self.events.write();

        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = Self::reusable_run_with_key(&runs, key) {
                return Ok(existing);
            }
        }

        let run = Run::new(run_id, spec.clone(), parent_run_id);
        runs.insert(run_id, run.clone());
        Self::push_event(&mut events, run_id, RunEventType::Submitted, None);
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read();
        let mut matched: Vec<Run> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        // Run ids are time-sortable, so this is chronological.
        matched.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError> {
        Ok(self
            .runs
            .read()
            .values()
            .find(|r| {
                r.idempotency_key.as_deref() == Some(key) && r.status == RunStatus::Completed
            })
            .cloned())
    }

    async fn update_status(
        &self,
        run_id: RunId,
        new_status: RunStatus,
        ctx: TransitionCtx,
    ) -> Result<Run, StoreError> {
        let mut runs = self.runs.write();
        let mut events = self.events.write();

        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let from = run.status;
        RunStatus::validate_transition(from, new_status)?;

        let now = Utc::now();
        run.status = new_status;
        match new_status {
            RunStatus::Running => {
                if run.started_at.is_none() {
                    run.started_at = Some(now);
                }
            }
            RunStatus::Pending => {
                // Retry re-entry: reset attempt timestamps, keep the error
                // for inspection until the next attempt overwrites it.
                run.started_at = None;
                run.completed_at = None;
                if from == RunStatus::Failed {
                    run.retry_count += 1;
                }
            }
            status if status.is_terminal() => {
                run.completed_at = Some(now);
            }
            _ => {}
        }
        if let Some(error) = &ctx.error {
            run.error = Some(truncate_error(error));
        }
        if let Some(output) = ctx.output {
            run.output = Some(output);
        }
        if let Some(external_ref) = ctx.external_ref {
            run.external_ref = Some(external_ref);
        }

        let event_type = RunEventType::for_transition(from, new_status);
        Self::push_event(&mut events, run_id, event_type, ctx.event_data);

        Ok(run.clone())
    }

    async fn record_event(
        &self,
        run_id: RunId,
        event_type: RunEventType,
        data: Option<Value>,
    ) -> Result<(), StoreError> {
        if !self.runs.read().contains_key(&run_id) {
            return Err(StoreError::RunNotFound(run_id));
        }
        let mut events = self.events.write();
        Self::push_event(&mut events, run_id, event_type, data);
        Ok(())
    }

    async fn load_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        Ok(self.events.read().get(&run_id).cloned().unwrap_or_default())
    }

    async fn set_external_ref(
        &self,
        run_id: RunId,
        external_ref: &str,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        match &run.external_ref {
            Some(existing) if existing != external_ref => Err(StoreError::Constraint(format!(
                "external_ref already set for {run_id}"
            ))),
            _ => {
                run.external_ref = Some(external_ref.to_string());
                Ok(())
            }
        }
    }

    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn add_to_dlq(
        &self,
        run_id: RunId,
        error: &str,
        retry_attempts: u32,
    ) -> Result<DeadLetter, StoreError> {
        let spec_json = {
            let runs = self.runs.read();
            let run = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
            serde_json::to_value(&run.spec)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
        };

        self.update_status(
            run_id,
            RunStatus::DeadLettered,
            TransitionCtx::with_error(error)
                .with_event_data(serde_json::json!({ "retry_attempts": retry_attempts })),
        )
        .await?;

        let entry = DeadLetter {
            dlq_id: Uuid::now_v7(),
            run_id,
            spec: spec_json,
            error: truncate_error(error),
            failed_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            retry_attempts,
        };
        self.dlq.write().insert(entry.dlq_id, entry.clone());
        Ok(entry)
    }

    async fn retry_from_dlq(&self, dlq_id: Uuid, resolved_by: &str) -> Result<Run, StoreError> {
        let run_id = {
            let dlq = self.dlq.read();
            let entry = dlq.get(&dlq_id).ok_or(StoreError::DlqEntryNotFound(dlq_id))?;
            if entry.resolved_at.is_some() {
                return Err(StoreError::AlreadyResolved(dlq_id));
            }
            entry.run_id
        };
        let run = self
            .update_status(run_id, RunStatus::Pending, TransitionCtx::default())
            .await?;

        let mut dlq = self.dlq.write();
        if let Some(entry) = dlq.get_mut(&dlq_id) {
            entry.resolved_at = Some(Utc::now());
            entry.resolved_by = Some(resolved_by.to_string());
        }
        Ok(run)
    }

    async fn get_dlq_entry(&self, dlq_id: Uuid) -> Result<DeadLetter, StoreError> {
        self.dlq
            .read()
            .get(&dlq_id)
            .cloned()
            .ok_or(StoreError::DlqEntryNotFound(dlq_id))
    }

    async fn list_dlq(&self, filter: &DlqFilter) -> Result<Vec<DeadLetter>, StoreError> {
        let dlq = self.dlq.read();
        let mut entries: Vec<DeadLetter> = dlq
            .values()
            .filter(|e| {
                if let Some(run_id) = filter.run_id {
                    if e.run_id != run_id {
                        return false;
                    }
                }
                if filter.unresolved_only && e.resolved_at.is_some() {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.failed_at);
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        Ok(entries
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: RunId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.write();
        let now = Utc::now();
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
            // Stale row: reap and fall through to acquire.
            locks.remove(key);
        }
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        locks.insert(
            key.to_string(),
            LockRow {
                lock_key: key.to_string(),
                owner_run_id: owner,
                acquired_at: now,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: RunId) -> Result<bool, StoreError> {
        let mut locks = self.locks.write();
        match locks.get(key) {
            Some(row) if row.owner_run_id == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_lock_held(&self, key: &str) -> Result<bool, StoreError> {
        let locks = self.locks.read();
        Ok(locks
            .get(key)
            .map(|row| row.expires_at > Utc::now())
            .unwrap_or(false))
    }

    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
        let mut locks = self.locks.write();
        let now = Utc::now();
        let before = locks.len();
        locks.retain(|_, row| row.expires_at > now);
        Ok((before - locks.len()) as u64)
    }

    async fn list_active_locks(&self) -> Result<Vec<LockRow>, StoreError> {
        let locks = self.locks.read();
        let now = Utc::now();
        Ok(locks
            .values()
            .filter(|row| row.expires_at > now)
            .cloned()
            .collect())
    }

    async fn upsert_manifest_stage(&self, stage: &ManifestStage) -> Result<(), StoreError> {
        let key = (
            stage.domain.clone(),
            stage.workflow.clone(),
            stage.partition.clone(),
            stage.stage.clone(),
        );
        self.manifest.write().insert(key, stage.clone());
        Ok(())
    }

    async fn load_manifest(
        &self,
        domain: &str,
        workflow: &str,
        partition: &str,
    ) -> Result<Vec<ManifestStage>, StoreError> {
        let manifest = self.manifest.read();
        let mut stages: Vec<ManifestStage> = manifest
            .values()
            .filter(|s| s.domain == domain && s.workflow == workflow && s.partition == partition)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.updated_at);
        Ok(stages)
    }

    async fn record_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError> {
        self.anomalies.write().push(anomaly.clone());
        Ok(())
    }
}
