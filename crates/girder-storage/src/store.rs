//! ExecutionStore trait definition
//!
//! The single contract through which the engine touches durable state:
//! the run ledger, the append-only event log, the dead-letter queue, the
//! advisory lock table, the stage manifest, and anomaly records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use girder_core::{
    DeadLetter, ErrorCategory, InvalidTransition, Run, RunEvent, RunEventType, RunId, RunStatus,
    WorkKind, WorkSpec,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Dead-letter entry not found
    #[error("dead-letter entry not found: {0}")]
    DlqEntryNotFound(Uuid),

    /// Status change outside the transition graph
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Dead-letter entry was already resolved
    #[error("dead-letter entry already resolved: {0}")]
    AlreadyResolved(Uuid),

    /// Transient connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Constraint violation
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Other database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Error category surfaced to retry logic
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Transient,
            Self::Constraint(_) | Self::InvalidTransition(_) | Self::AlreadyResolved(_) => {
                ErrorCategory::Validation
            }
            _ => ErrorCategory::Unknown,
        }
    }
}

/// Filter for listing runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub kind: Option<WorkKind>,
    pub name: Option<String>,
    pub parent_run_id: Option<RunId>,
    /// Only runs whose last heartbeat is older than this instant (or that
    /// never heartbeat); for finding unresponsive runs
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            kind: None,
            name: None,
            parent_run_id: None,
            heartbeat_before: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: WorkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: RunId) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn with_heartbeat_before(mut self, instant: DateTime<Utc>) -> Self {
        self.heartbeat_before = Some(instant);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a run passes this filter (shared by in-memory evaluation)
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if run.spec.kind != kind {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &run.spec.name != name {
                return false;
            }
        }
        if let Some(parent) = self.parent_run_id {
            if run.parent_run_id != Some(parent) {
                return false;
            }
        }
        if let Some(before) = self.heartbeat_before {
            match run.last_heartbeat_at {
                Some(at) if at >= before => return false,
                _ => {}
            }
        }
        true
    }
}

/// Filter for listing dead-letter entries
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub run_id: Option<RunId>,
    pub unresolved_only: bool,
    pub limit: u32,
    pub offset: u32,
}

impl DlqFilter {
    pub fn unresolved() -> Self {
        Self {
            unresolved_only: true,
            limit: 100,
            ..Default::default()
        }
    }
}

/// Extra data carried by a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionCtx {
    /// Error message; truncated to the ledger bound before storage
    pub error: Option<String>,

    /// Output recorded alongside a completion
    pub output: Option<Value>,

    /// Backend handle; immutable once set
    pub external_ref: Option<String>,

    /// Payload for the event written with the transition
    pub event_data: Option<Value>,
}

impl TransitionCtx {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn with_event_data(mut self, data: Value) -> Self {
        self.event_data = Some(data);
        self
    }
}

/// Advisory lock row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRow {
    pub lock_key: String,
    pub owner_run_id: RunId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Stage row written by the tracked workflow runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStage {
    pub domain: String,
    pub workflow: String,
    pub partition: String,
    pub stage: String,
    pub row_count: Option<i64>,
    pub metrics: Value,
    pub updated_at: DateTime<Utc>,
    pub execution_id: Option<RunId>,
    pub batch_id: Option<Uuid>,
}

/// Severity attached to anomaly records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Anomaly written by the tracked runner on step failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub anomaly_id: Uuid,
    pub run_id: RunId,
    pub step: String,
    pub severity: AnomalySeverity,
    pub category: ErrorCategory,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl AnomalyRecord {
    pub fn new(
        run_id: RunId,
        step: impl Into<String>,
        severity: AnomalySeverity,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            anomaly_id: Uuid::now_v7(),
            run_id,
            step: step.into(),
            severity,
            category,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Durable storage of runs, events, dead letters, locks, and manifests
///
/// Implementations must be thread-safe. Every status update validates the
/// transition against the state machine and writes the matching event in
/// the same transaction; on failure both are rolled back.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Run ledger
    // =========================================================================

    /// Insert a new Pending run and its SUBMITTED event.
    ///
    /// If the spec carries an idempotency key and a run with the same key
    /// is in flight or already Completed, that run is returned unchanged
    /// (the returned id may differ from `run_id`). Only Cancelled and
    /// DeadLettered runs release a key for fresh submission.
    async fn create_run(
        &self,
        run_id: RunId,
        spec: &WorkSpec,
        parent_run_id: Option<RunId>,
    ) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// The prior COMPLETED run for this idempotency key, if any
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError>;

    /// Apply a validated status transition.
    ///
    /// Stamps `started_at` on the first Running, `completed_at` on
    /// terminal states (clearing both when a retry re-enters Pending),
    /// increments `retry_count` on Failed → Pending, and appends the
    /// event implied by the transition.
    async fn update_status(
        &self,
        run_id: RunId,
        new_status: RunStatus,
        ctx: TransitionCtx,
    ) -> Result<Run, StoreError>;

    /// Append a standalone event (PROGRESS, RECONCILED, ...)
    async fn record_event(
        &self,
        run_id: RunId,
        event_type: RunEventType,
        data: Option<Value>,
    ) -> Result<(), StoreError>;

    /// All events for a run, in insertion order
    async fn load_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError>;

    /// Set the backend handle; fails if a different ref is already set
    async fn set_external_ref(&self, run_id: RunId, external_ref: &str)
        -> Result<(), StoreError>;

    /// Stamp `last_heartbeat_at`
    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError>;

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    /// Park a failed run: transitions it to DeadLettered and inserts the
    /// DLQ row in one logical operation.
    async fn add_to_dlq(
        &self,
        run_id: RunId,
        error: &str,
        retry_attempts: u32,
    ) -> Result<DeadLetter, StoreError>;

    /// Re-queue a dead-lettered run: transitions it back to Pending and
    /// stamps `resolved_at` / `resolved_by` on the DLQ row. Fails with
    /// `AlreadyResolved` on a second call.
    async fn retry_from_dlq(&self, dlq_id: Uuid, resolved_by: &str) -> Result<Run, StoreError>;

    async fn get_dlq_entry(&self, dlq_id: Uuid) -> Result<DeadLetter, StoreError>;

    async fn list_dlq(&self, filter: &DlqFilter) -> Result<Vec<DeadLetter>, StoreError>;

    // =========================================================================
    // Advisory locks
    // =========================================================================

    /// Atomic insert-or-fail of a lock row. A held lock whose `expires_at`
    /// has passed is reaped and the acquire retried once.
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: RunId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Remove the lock if `owner` matches; returns whether a row was removed
    async fn release_lock(&self, key: &str, owner: RunId) -> Result<bool, StoreError>;

    /// Whether an unexpired lock row exists for `key`
    async fn is_lock_held(&self, key: &str) -> Result<bool, StoreError>;

    /// Reap all expired locks, returning the count removed
    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError>;

    async fn list_active_locks(&self) -> Result<Vec<LockRow>, StoreError>;

    // =========================================================================
    // Manifest and anomalies
    // =========================================================================

    /// UPSERT a stage row keyed by (domain, workflow, partition, stage)
    async fn upsert_manifest_stage(&self, stage: &ManifestStage) -> Result<(), StoreError>;

    /// All stage rows for one (domain, workflow, partition)
    async fn load_manifest(
        &self,
        domain: &str,
        workflow: &str,
        partition: &str,
    ) -> Result<Vec<ManifestStage>, StoreError>;

    async fn record_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError>;
}
