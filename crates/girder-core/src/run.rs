//! Runs, run events, and dead letters
//!
//! A `Run` is the authoritative record of one unit of execution. Its
//! lifecycle is an append-only sequence of `RunEvent`s; a run that
//! exhausts its retry budget is parked as a `DeadLetter`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::id::RunId;
use crate::status::RunStatus;
use crate::work::WorkSpec;

/// Upper bound on stored error messages, in bytes
pub const MAX_ERROR_LEN: usize = 1024;

/// Truncate an error message to `MAX_ERROR_LEN` on a char boundary
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Authoritative record of one unit of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,

    /// The spec that produced this run
    pub spec: WorkSpec,

    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    /// Set on the first transition to Running
    pub started_at: Option<DateTime<Utc>>,

    /// Set on any terminal state; cleared when a retry re-enters Pending
    pub completed_at: Option<DateTime<Utc>>,

    /// Incremented each time a retry re-enters Pending from Failed
    pub retry_count: u32,

    /// Last error message, bounded to `MAX_ERROR_LEN`
    pub error: Option<String>,

    /// Denormalized from the spec for indexed lookup
    pub idempotency_key: Option<String>,

    /// Links workflow sub-runs to their parent
    pub parent_run_id: Option<RunId>,

    /// Opaque handle from the executor backend; immutable once set
    pub external_ref: Option<String>,

    /// Stamped by the reconciler on each observation cycle
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Output recorded on completion
    pub output: Option<Value>,
}

impl Run {
    /// A fresh Pending run for the given spec
    pub fn new(run_id: RunId, spec: WorkSpec, parent_run_id: Option<RunId>) -> Self {
        let idempotency_key = spec.idempotency_key.clone();
        Self {
            run_id,
            spec,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            idempotency_key,
            parent_run_id,
            external_ref: None,
            last_heartbeat_at: None,
            output: None,
        }
    }
}

/// Lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventType {
    Submitted,
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    DeadLettered,
    Reconciled,
    OrphanDetected,
}

impl RunEventType {
    /// Event type implied by a validated status transition
    pub fn for_transition(from: RunStatus, to: RunStatus) -> Self {
        match (from, to) {
            (RunStatus::Failed, RunStatus::Pending)
            | (RunStatus::DeadLettered, RunStatus::Pending) => Self::Retrying,
            (_, RunStatus::Queued) => Self::Queued,
            (_, RunStatus::Running) => Self::Started,
            (_, RunStatus::Completed) => Self::Completed,
            (_, RunStatus::Failed) => Self::Failed,
            (_, RunStatus::Cancelled) => Self::Cancelled,
            (_, RunStatus::DeadLettered) => Self::DeadLettered,
            (_, RunStatus::Pending) => Self::Submitted,
        }
    }
}

impl std::fmt::Display for RunEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Progress => "PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Retrying => "RETRYING",
            Self::DeadLettered => "DEAD_LETTERED",
            Self::Reconciled => "RECONCILED",
            Self::OrphanDetected => "ORPHAN_DETECTED",
        };
        write!(f, "{s}")
    }
}

/// Append-only lifecycle record
///
/// Events are never modified or deleted; replaying them in insertion
/// order recovers the status history of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: Uuid,
    pub run_id: RunId,
    pub event_type: RunEventType,
    pub timestamp: DateTime<Utc>,
    pub data: Option<Value>,
}

impl RunEvent {
    pub fn new(run_id: RunId, event_type: RunEventType, data: Option<Value>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            run_id,
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// One row per run that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub dlq_id: Uuid,

    pub run_id: RunId,

    /// JSON form of the spec; container specs are redacted at construction
    pub spec: Value,

    pub error: String,

    pub failed_at: DateTime<Utc>,

    /// Stamped when the entry is re-queued or resolved
    pub resolved_at: Option<DateTime<Utc>>,

    pub resolved_by: Option<String>,

    /// Number of retries performed before dead-lettering
    pub retry_attempts: u32,
}
