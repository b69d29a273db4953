//! Run status and the transition graph

use serde::{Deserialize, Serialize};

/// Status of a run in the execution ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted but not yet handed to an executor
    Pending,

    /// Handed to an executor, waiting to start
    Queued,

    /// A handler is executing
    Running,

    /// Finished successfully
    Completed,

    /// Last attempt failed; may re-enter Pending via retry
    Failed,

    /// Cancelled by a caller; admits no further transitions
    Cancelled,

    /// Retries exhausted; parked in the dead-letter queue
    DeadLettered,
}

impl RunStatus {
    /// Whether the run has reached a state callers can stop waiting on.
    ///
    /// `Failed` is not settled: the dispatcher either retries it or moves
    /// it to the dead-letter queue promptly.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::DeadLettered)
    }

    /// Whether `completed_at` should be stamped when entering this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::DeadLettered
        )
    }

    /// Statuses a run may legally move to from `self`
    pub fn allowed_transitions(&self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[Self::Queued, Self::Running, Self::Cancelled],
            Self::Queued => &[
                Self::Running,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Failed => &[Self::DeadLettered, Self::Pending],
            Self::DeadLettered => &[Self::Pending],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    /// Validate a transition against the state machine.
    ///
    /// The ledger calls this before every status write; an
    /// `InvalidTransition` leaves the ledger unchanged.
    pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), InvalidTransition> {
        if from.allowed_transitions().contains(&to) {
            Ok(())
        } else {
            Err(InvalidTransition { from, to })
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Attempted status change outside the transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    const ALL: [RunStatus; 7] = [
        Pending,
        Queued,
        Running,
        Completed,
        Failed,
        Cancelled,
        DeadLettered,
    ];

    #[test]
    fn test_allowed_transitions() {
        assert!(RunStatus::validate_transition(Pending, Queued).is_ok());
        assert!(RunStatus::validate_transition(Pending, Running).is_ok());
        assert!(RunStatus::validate_transition(Queued, Running).is_ok());
        assert!(RunStatus::validate_transition(Running, Completed).is_ok());
        assert!(RunStatus::validate_transition(Running, Failed).is_ok());
        assert!(RunStatus::validate_transition(Failed, Pending).is_ok());
        assert!(RunStatus::validate_transition(Failed, DeadLettered).is_ok());
        assert!(RunStatus::validate_transition(DeadLettered, Pending).is_ok());
    }

    #[test]
    fn test_terminal_states_admit_nothing() {
        for to in ALL {
            assert!(RunStatus::validate_transition(Completed, to).is_err());
            assert!(RunStatus::validate_transition(Cancelled, to).is_err());
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(RunStatus::validate_transition(Pending, Completed).is_err());
        assert!(RunStatus::validate_transition(Pending, Failed).is_err());
        assert!(RunStatus::validate_transition(Running, Pending).is_err());
        assert!(RunStatus::validate_transition(Running, DeadLettered).is_err());
        assert!(RunStatus::validate_transition(Failed, Completed).is_err());
        assert!(RunStatus::validate_transition(DeadLettered, Running).is_err());
    }

    #[test]
    fn test_full_graph_matches_enumeration() {
        // Every (from, to) pair is either in the graph or rejected; no panics.
        for from in ALL {
            for to in ALL {
                let expected = from.allowed_transitions().contains(&to);
                assert_eq!(
                    RunStatus::validate_transition(from, to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_settled_and_terminal() {
        assert!(Completed.is_settled());
        assert!(Cancelled.is_settled());
        assert!(DeadLettered.is_settled());
        assert!(!Failed.is_settled());
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
        let parsed: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, DeadLettered);
    }
}
