// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling a condition until it becomes true
//!
//! The control plane under test applies changes asynchronously and at its own
//! pace, so nearly every check made by the verifier has the shape "look at
//! some state, and if it's not what we want yet, look again in a moment".
//! [`wait_for_condition()`] and [`wait_for_condition_with_policy()`] implement
//! that loop with a hard upper bound on how long to keep looking.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of one check of the condition passed to [`wait_for_condition()`]
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not yet true
    NotYet,
    /// the check failed; the [`RetryPolicy`] decides whether this ends the
    /// wait or is recorded and retried
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

/// How the poller treats a [`CondCheckError::Failed`] value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// record it as the last observed error and keep polling
    Transient,
    /// stop polling and return it
    Permanent,
}

/// Error returned when the condition never became true
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("timed out after {elapsed:?}")]
    TimedOut {
        /// wall-clock time spent polling; never less than the timeout
        elapsed: Duration,
        /// the most recent transient error reported by the condition
        last_error: Option<E>,
    },
    #[error("unrecoverable error while polling on condition: {0}")]
    PermanentError(E),
}

impl<E> PollError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            PollError::TimedOut { last_error, .. } => last_error.as_ref(),
            PollError::PermanentError(e) => Some(e),
        }
    }
}

/// Interval, timeout and error classification for one polling loop
pub struct RetryPolicy<E> {
    interval: Duration,
    timeout: Duration,
    classify: Box<dyn Fn(&E) -> ErrorClass + Send + Sync>,
}

impl<E> RetryPolicy<E> {
    /// A policy under which any failure reported by the condition ends the
    /// wait immediately.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        RetryPolicy {
            interval,
            timeout,
            classify: Box::new(|_| ErrorClass::Permanent),
        }
    }

    /// A policy under which every failure reported by the condition is
    /// treated as a transient observation problem.  Only the timeout ends
    /// the wait.
    pub fn retry_all(interval: Duration, timeout: Duration) -> Self {
        RetryPolicy {
            interval,
            timeout,
            classify: Box::new(|_| ErrorClass::Transient),
        }
    }

    /// Replace the error classification hook.
    pub fn with_classifier<F>(mut self, classify: F) -> Self
    where
        F: Fn(&E) -> ErrorClass + Send + Sync + 'static,
    {
        self.classify = Box::new(classify);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn classify(&self, error: &E) -> ErrorClass {
        (self.classify)(error)
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed.
///
/// Any [`CondCheckError::Failed`] returned by `cond` is permanent.  Use
/// [`wait_for_condition_with_policy()`] to retry through failures.
pub async fn wait_for_condition<O, E, Func, Fut>(
    cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let policy = RetryPolicy::new(*poll_interval, *poll_max);
    wait_for_condition_with_policy(cond, &policy).await
}

/// Poll the given closure according to `policy`.
///
/// The closure is invoked once immediately and then once per interval.  The
/// wait ends with [`PollError::TimedOut`] only after at least the policy's
/// timeout has elapsed, so a condition that never becomes true can neither
/// fail early nor succeed silently.
pub async fn wait_for_condition_with_policy<O, E, Func, Fut>(
    mut cond: Func,
    policy: &RetryPolicy<E>,
) -> Result<O, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    let mut last_error = None;
    loop {
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::NotYet) => (),
            Err(CondCheckError::Failed(error)) => match policy.classify(&error)
            {
                ErrorClass::Permanent => {
                    return Err(PollError::PermanentError(error));
                }
                ErrorClass::Transient => last_error = Some(error),
            },
        }

        let elapsed = poll_start.elapsed();
        if elapsed >= policy.timeout {
            return Err(PollError::TimedOut { elapsed, last_error });
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_secs(2);
    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_once_condition_holds() {
        let attempts = AtomicUsize::new(0);
        let result = wait_for_condition::<_, (), _, _>(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok(n)
                }
            },
            &INTERVAL,
            &TIMEOUT,
        )
        .await
        .expect("condition should eventually hold");
        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_no_earlier_than_timeout() {
        let start = Instant::now();
        let error = wait_for_condition::<(), (), _, _>(
            || async { Err(CondCheckError::NotYet) },
            &INTERVAL,
            &TIMEOUT,
        )
        .await
        .expect_err("condition never holds");
        match error {
            PollError::TimedOut { elapsed, last_error } => {
                assert!(elapsed >= TIMEOUT, "gave up early: {:?}", elapsed);
                assert!(last_error.is_none());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(start.elapsed() >= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_permanent_by_default() {
        let attempts = AtomicUsize::new(0);
        let error = wait_for_condition::<(), _, _, _>(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CondCheckError::Failed("boom"))
            },
            &INTERVAL,
            &TIMEOUT,
        )
        .await
        .expect_err("condition fails");
        assert!(matches!(error, PollError::PermanentError("boom")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_and_reported() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::retry_all(INTERVAL, TIMEOUT);
        let error = wait_for_condition_with_policy::<(), _, _, _>(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Err(CondCheckError::Failed(format!("attempt {}", n)))
            },
            &policy,
        )
        .await
        .expect_err("condition never holds");
        let count = attempts.load(Ordering::SeqCst);
        assert!(count > 1);
        assert_eq!(
            error.last_error().map(String::as_str),
            Some(format!("attempt {}", count - 1).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::retry_all(INTERVAL, TIMEOUT);
        let value = wait_for_condition_with_policy(
            || async {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(CondCheckError::Failed("unreachable")),
                    2 => Err(CondCheckError::NotYet),
                    _ => Ok("converged"),
                }
            },
            &policy,
        )
        .await
        .expect("transient failures should not end the wait");
        assert_eq!(value, "converged");
    }

    #[test]
    fn test_classifier_keeps_interval_and_timeout() {
        let policy = RetryPolicy::retry_all(INTERVAL, TIMEOUT)
            .with_classifier(|_: &()| ErrorClass::Permanent);
        assert_eq!(policy.interval(), INTERVAL);
        assert_eq!(policy.timeout(), TIMEOUT);
        assert_eq!(policy.classify(&()), ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_decides() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::retry_all(INTERVAL, TIMEOUT).with_classifier(
            |e: &u32| {
                if *e >= 2 {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            },
        );
        let error = wait_for_condition_with_policy::<(), _, _, _>(
            || async {
                let n = u32::try_from(attempts.fetch_add(1, Ordering::SeqCst))
                    .unwrap();
                Err(CondCheckError::Failed(n))
            },
            &policy,
        )
        .await
        .expect_err("condition fails");
        assert!(matches!(error, PollError::PermanentError(2)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
