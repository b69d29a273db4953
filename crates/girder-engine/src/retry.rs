//! Retry execution wrapper
//!
//! `with_retry` drives any fallible async operation through a
//! `RetryPolicy`, sleeping the backoff delays and honoring an optional
//! deadline. The dispatcher applies retries at the run level; the
//! workflow runner applies them at the step level.

use std::future::Future;

use tracing::debug;

use girder_core::{RetryContext, RetryDecision, RetryPolicy, WorkError};

use crate::deadline::{sleep_within, Deadline};

/// Run `op` until it succeeds, the policy stops retrying, or the deadline
/// expires. The operation receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Deadline>,
    mut op: F,
) -> Result<T, WorkError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    let mut ctx = RetryContext::default();
    loop {
        ctx.attempt += 1;
        match op(ctx.attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                ctx.last_error = Some(err.message.clone());
                match policy.decide(ctx.attempt, err.category) {
                    RetryDecision::Stop => return Err(err),
                    RetryDecision::Retry(delay) => {
                        debug!(
                            attempt = ctx.attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying after backoff"
                        );
                        ctx.total_delay += delay;
                        if sleep_within(delay, deadline).await.is_err() {
                            return Err(WorkError::timeout(format!(
                                "deadline exceeded during retry backoff (attempt {}): {}",
                                ctx.attempt, err.message
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// Convenience form without a deadline
pub async fn with_retry_policy<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, WorkError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    with_retry(policy, None, op).await
}

/// Total attempts a policy allows
pub fn max_attempts(policy: &RetryPolicy) -> u32 {
    policy.max_retries + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use girder_core::{Backoff, ErrorCategory};

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Backoff::constant(Duration::ZERO)).with_jitter(false)
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry_policy(&instant_policy(3), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, WorkError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry_policy(&instant_policy(3), |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(WorkError::transient("flaky"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry_policy(&instant_policy(2), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkError::transient("always fails"))
            }
        })
        .await;
        assert!(result.is_err());
        // max_retries = 2 means three attempts total.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry_policy(&instant_policy(5), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkError::validation("bad input"))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff() {
        let policy =
            RetryPolicy::new(10, Backoff::constant(Duration::from_secs(10))).with_jitter(false);
        let deadline = Deadline::after(Duration::from_millis(30));
        let result: Result<(), _> = with_retry(&policy, Some(deadline), |_| async {
            Err(WorkError::transient("slow downstream"))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
    }
}
