//! Retry logic.
//!
//! # Responsibilities
//! - Describe a retry policy as plain data (attempts, backoff, jitter)
//! - Execute it with one explicit loop that awaits each attempt
//! - Stop on permanent errors and on cancellation
//!
//! # Design Decisions
//! - The guard layers never retry on their own; callers opt in here
//! - Lock contention backs off normally, circuit rejections wait at least
//!   the breaker's remaining cooldown, resource pressure waits longer
//! - Jittered backoff prevents thundering herd

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::RetryConfig;
use crate::error::{Classify, FailureKind, GuardError, RemoteError};
use crate::lifecycle::Cancellation;
use crate::resilience::backoff::calculate_backoff;

/// How an error wants to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Do not retry.
    Stop,
    /// Retry after the normal backoff.
    Backoff,
    /// Retry after a longer, deferred backoff.
    Defer,
    /// Retry after at least this long.
    After(Duration),
}

/// Errors that know how they should be retried.
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

impl Retryable for RemoteError {
    fn retry_hint(&self) -> RetryHint {
        match self.failure_kind() {
            FailureKind::Transient => RetryHint::Backoff,
            FailureKind::Permanent => RetryHint::Stop,
        }
    }
}

impl Retryable for std::io::Error {
    fn retry_hint(&self) -> RetryHint {
        match self.failure_kind() {
            FailureKind::Transient => RetryHint::Backoff,
            FailureKind::Permanent => RetryHint::Stop,
        }
    }
}

impl<E: Classify> Retryable for GuardError<E> {
    fn retry_hint(&self) -> RetryHint {
        match self {
            GuardError::LockHeld { .. } => RetryHint::Backoff,
            GuardError::CircuitOpen { retry_after, .. } => RetryHint::After(*retry_after),
            GuardError::ResourceExhausted { .. } => RetryHint::Defer,
            GuardError::LeaseLost { .. } | GuardError::Cancelled => RetryHint::Stop,
            GuardError::Store(err) => err.retry_hint(),
            GuardError::Operation(err) => match err.failure_kind() {
                FailureKind::Transient => RetryHint::Backoff,
                FailureKind::Permanent => RetryHint::Stop,
            },
        }
    }
}

/// Caller-supplied retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Multiplier applied to the backoff for `RetryHint::Defer`.
    pub deferred_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
            deferred_multiplier: config.deferred_multiplier,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32, hint: RetryHint) -> Option<Duration> {
        let backoff = calculate_backoff(attempt, self.base_delay, self.max_delay, self.jitter_ratio);
        match hint {
            RetryHint::Stop => None,
            RetryHint::Backoff => Some(backoff),
            RetryHint::Defer => Some(backoff.mul_f64(self.deferred_multiplier.max(1.0))),
            RetryHint::After(at_least) => Some(backoff.max(at_least)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Why a retried operation finally failed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Stopped(E),

    #[error("retry cancelled")]
    Cancelled { last: Option<E> },
}

impl<E> RetryError<E> {
    /// The last error seen, if any attempt completed.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Stopped(last) => Some(last),
            RetryError::Cancelled { last } => last,
        }
    }
}

/// Run `attempt` under `policy`, sleeping between attempts.
///
/// `attempt` receives the 1-based attempt number.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &Cancellation,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt_no = 0u32;
    loop {
        attempt_no += 1;
        let result = match cancel.run(attempt(attempt_no)).await {
            Ok(result) => result,
            Err(_) => return Err(RetryError::Cancelled { last: None }),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let hint = err.retry_hint();
        let Some(delay) = policy.delay_for(attempt_no, hint) else {
            return Err(RetryError::Stopped(err));
        };
        if attempt_no >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt_no,
                last: err,
            });
        }

        tracing::debug!(
            attempt = attempt_no,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            hint = ?hint,
            "Retrying after failure"
        );
        if cancel.run(tokio::time::sleep(delay)).await.is_err() {
            return Err(RetryError::Cancelled { last: Some(err) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_ratio: 0.0,
            deferred_multiplier: 4.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(5), &Cancellation::never(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RemoteError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast_policy(5), &Cancellation::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Permanent("400".into())) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Stopped(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let result: Result<(), _> = retry(&fast_policy(3), &Cancellation::never(), |_| async {
            Err(RemoteError::Transient("timeout".into()))
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..fast_policy(5)
        };
        let cancel = Cancellation::after(Duration::from_millis(30));
        let result: Result<(), _> = retry(&policy, &cancel, |_| async {
            Err(RemoteError::Transient("busy".into()))
        })
        .await;

        match result {
            Err(RetryError::Cancelled { last }) => assert!(last.is_some()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 50,
            max_delay_ms: 400,
            jitter_ratio: 0.0,
            deferred_multiplier: 3.0,
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_millis(400));
        assert_eq!(policy.delay_for(1, RetryHint::Defer), Some(Duration::from_millis(150)));
        assert_eq!(RetryPolicy::default(), RetryPolicy::from_config(&RetryConfig::default()));
    }

    #[test]
    fn test_delay_hints() {
        let policy = fast_policy(3);
        assert_eq!(policy.delay_for(1, RetryHint::Stop), None);
        assert_eq!(policy.delay_for(1, RetryHint::Backoff), Some(Duration::from_millis(1)));
        assert_eq!(policy.delay_for(1, RetryHint::Defer), Some(Duration::from_millis(4)));
        assert_eq!(
            policy.delay_for(1, RetryHint::After(Duration::from_secs(2))),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_guard_errors_map_to_hints() {
        let open: GuardError<RemoteError> = GuardError::CircuitOpen {
            dependency: "driveApi".into(),
            retry_after: Duration::from_secs(9),
        };
        assert_eq!(open.retry_hint(), RetryHint::After(Duration::from_secs(9)));

        let exhausted: GuardError<RemoteError> = GuardError::ResourceExhausted { pressure: 99.0 };
        assert_eq!(exhausted.retry_hint(), RetryHint::Defer);

        let permanent = GuardError::Operation(RemoteError::Permanent("gone".into()));
        assert_eq!(permanent.retry_hint(), RetryHint::Stop);
    }
}
