//! Retry policy values
//!
//! Pure data: backoff curves and the retry decision procedure. The engine
//! crate provides the `with_retry` execution wrapper on top of these.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// Backoff curve between retry attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// base * multiplier^(n-1), capped at max_delay
    Exponential {
        #[serde(with = "duration_millis")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "duration_millis")]
        max_delay: Duration,
    },

    /// base * n, capped at max_delay
    Linear {
        #[serde(with = "duration_millis")]
        base: Duration,
        #[serde(with = "duration_millis")]
        max_delay: Duration,
    },

    /// Same delay every time
    Constant {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
}

impl Backoff {
    /// Exponential with 2x multiplier and a 60 second cap
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn linear(base: Duration) -> Self {
        Self::Linear {
            base,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn constant(delay: Duration) -> Self {
        Self::Constant { delay }
    }

    /// Delay before the `retry_number`-th retry (1-based), pre-jitter
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        let n = retry_number.max(1);
        match self {
            Self::Exponential {
                base,
                multiplier,
                max_delay,
            } => {
                let raw = base.as_secs_f64() * multiplier.powi(n as i32 - 1);
                Duration::from_secs_f64(raw.min(max_delay.as_secs_f64()))
            }
            Self::Linear { base, max_delay } => {
                let raw = base.as_secs_f64() * n as f64;
                Duration::from_secs_f64(raw.min(max_delay.as_secs_f64()))
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    Retry(Duration),

    /// Give up
    Stop,
}

/// Retry policy attached to a spec, a workflow, or a step
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use girder_core::retry::{Backoff, RetryPolicy};
///
/// let policy = RetryPolicy::new(3, Backoff::exponential(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (total attempts = max_retries + 1)
    pub max_retries: u32,

    /// Backoff curve
    pub backoff: Backoff,

    /// Multiply each delay by a uniform factor in [0.5, 1.5]
    pub jitter: bool,

    /// Categories that are never retried under this policy
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<ErrorCategory>,

    /// Categories retried even though they are not retryable by default
    #[serde(default)]
    pub retryable_overrides: Vec<ErrorCategory>,
}

fn default_non_retryable() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Validation,
        ErrorCategory::Config,
        ErrorCategory::Auth,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            jitter: true,
            non_retryable: default_non_retryable(),
            retryable_overrides: vec![],
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Backoff::constant(Duration::ZERO))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_non_retryable(mut self, category: ErrorCategory) -> Self {
        self.non_retryable.push(category);
        self
    }

    /// Allow retrying a category that is non-retryable by default
    pub fn with_retryable_override(mut self, category: ErrorCategory) -> Self {
        self.retryable_overrides.push(category);
        self
    }

    /// Whether an error of this category may be retried under this policy
    pub fn should_retry(&self, category: ErrorCategory) -> bool {
        if self.non_retryable.contains(&category) {
            return false;
        }
        if self.retryable_overrides.contains(&category) {
            return true;
        }
        category.retryable_by_default()
    }

    /// Delay before the next attempt, with jitter applied
    pub fn next_delay(&self, retry_number: u32) -> Duration {
        let base = self.backoff.delay_for(retry_number);
        if self.jitter && !base.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        }
    }

    /// Decide whether to retry after `attempts_made` attempts (1-based)
    /// failed with the given category.
    pub fn decide(&self, attempts_made: u32, category: ErrorCategory) -> RetryDecision {
        if attempts_made >= self.max_retries + 1 {
            return RetryDecision::Stop;
        }
        if !self.should_retry(category) {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(self.next_delay(attempts_made))
    }
}

/// State threaded through a retry loop
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Attempts made so far (1-based once the first attempt runs)
    pub attempt: u32,

    /// Message of the most recent failure
    pub last_error: Option<String>,

    /// Total time slept across all backoffs
    pub total_delay: Duration,
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
