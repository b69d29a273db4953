//! Scoped deadlines
//!
//! A deadline is a monotonic instant consulted at well-defined
//! checkpoints: before each step, after each sleep, and inside retry
//! loops. Nested scopes combine with `earliest`, so the effective
//! deadline is always the tightest enclosing one.

use std::time::{Duration, Instant};

/// A monotonic deadline instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    /// Deadline at a specific instant
    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Whether the deadline has passed
    pub fn exceeded(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, or `None` once exceeded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.checked_duration_since(Instant::now())
    }

    /// The tighter of two optional deadlines
    pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a.at <= b.at { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// Outcome of a deadline-aware sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Sleep for `duration`, but never past `deadline`.
///
/// Returns `Err(DeadlineExceeded)` if the deadline cuts the sleep short
/// (or had already passed).
pub async fn sleep_within(
    duration: Duration,
    deadline: Option<Deadline>,
) -> Result<(), DeadlineExceeded> {
    match deadline {
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
        Some(deadline) => {
            let Some(remaining) = deadline.remaining() else {
                return Err(DeadlineExceeded);
            };
            if duration <= remaining {
                tokio::time::sleep(duration).await;
                Ok(())
            } else {
                tokio::time::sleep(remaining).await;
                Err(DeadlineExceeded)
            }
        }
    }
}
