//! Retry combinator shared by the job runner and the worker loop.
//!
//! `retry` drives an async operation until it succeeds, fails with a
//! non-retryable error, runs out of attempts, or the cancellation token
//! fires. Waits between attempts are cancellable.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry straight away, at most `max_retries` times after the first attempt.
    Immediate { max_retries: u32 },
    /// Retry forever, waiting `2^failures` seconds clamped to `[min, max]`.
    Exponential { min: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay to apply after `failures` consecutive failures, or `None` once
    /// the policy is exhausted.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Immediate { max_retries } => {
                (failures <= max_retries).then_some(Duration::ZERO)
            }
            RetryPolicy::Exponential { min, max } => Some(exponential_delay(failures, min, max)),
        }
    }
}

/// `2^exponent` seconds clamped to `[min, max]`.
pub fn exponential_delay(exponent: u32, min: Duration, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(exponent.min(63)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).clamp(min, max.max(min))
}

/// Final result of a `retry` call.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// Every allowed attempt failed with a retryable error.
    Exhausted { error: E, attempts: u32 },
    /// The operation failed with an error the predicate rejected.
    Fatal { error: E, attempts: u32 },
    Cancelled { attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Fatal { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Runs `op` under `policy`.
///
/// `op` receives the zero-based attempt number. The token is checked before
/// every attempt and raced against every wait; an in-flight attempt is
/// never interrupted.
pub async fn retry<T, E, F, Fut, P>(
    mut op: F,
    is_retryable: P,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled { attempts };
        }

        let result = op(attempts).await;
        attempts += 1;

        let error = match result {
            Ok(value) => return RetryOutcome::Succeeded { value, attempts },
            Err(e) if !is_retryable(&e) => return RetryOutcome::Fatal { error: e, attempts },
            Err(e) => e,
        };

        let Some(delay) = policy.delay_after(attempts) else {
            return RetryOutcome::Exhausted { error, attempts };
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
