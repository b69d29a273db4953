//! Step and workflow result envelopes

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCategory;
use crate::work::Params;

/// Quality metrics a step may attach to its result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepQuality {
    /// Rows produced or affected, when meaningful
    pub row_count: Option<i64>,

    /// Free-form metrics payload
    #[serde(default)]
    pub metrics: Value,
}

/// What a step produced
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Success; output is materialized into the context under the step name
    Completed {
        output: Value,
        quality: Option<StepQuality>,
    },

    /// Counts as success but produces no output
    Skipped { reason: String },

    Failed {
        error: String,
        category: ErrorCategory,
        quality: Option<StepQuality>,
    },
}

/// Envelope returned by every step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub outcome: StepOutcome,

    /// Overrides linear flow; set by choice steps
    pub next_step: Option<String>,

    /// Parameter updates merged into subsequent context snapshots
    pub context_updates: Option<Params>,
}

impl StepResult {
    pub fn ok(output: Value) -> Self {
        Self {
            outcome: StepOutcome::Completed {
                output,
                quality: None,
            },
            next_step: None,
            context_updates: None,
        }
    }

    pub fn ok_with_quality(output: Value, quality: StepQuality) -> Self {
        Self {
            outcome: StepOutcome::Completed {
                output,
                quality: Some(quality),
            },
            next_step: None,
            context_updates: None,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Skipped {
                reason: reason.into(),
            },
            next_step: None,
            context_updates: None,
        }
    }

    pub fn fail(error: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            outcome: StepOutcome::Failed {
                error: error.into(),
                category,
                quality: None,
            },
            next_step: None,
            context_updates: None,
        }
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }

    pub fn with_context_updates(mut self, updates: Params) -> Self {
        self.context_updates = Some(updates);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Completed { .. } | StepOutcome::Skipped { .. }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { .. })
    }
}

/// Terminal status of one workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a step ended, as recorded in the workflow result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDisposition {
    Completed,
    Skipped,
    /// Resumed from a prior execution's manifest without re-running
    Resumed,
    Failed,
}

/// Per-step record in a workflow result
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub disposition: StepDisposition,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
}

/// Summary of one workflow execution
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,

    /// Steps in the order they finished (or were recorded as failed)
    pub completed_steps: Vec<StepRecord>,

    /// Step the failure is attributed to
    pub error_step: Option<String>,

    pub error: Option<String>,

    /// Accumulated step outputs from the final context
    pub outputs: HashMap<String, Value>,

    pub duration: Duration,
}

impl WorkflowResult {
    pub fn step_names(&self) -> Vec<&str> {
        self.completed_steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}
