//! Bounded-time convergence polling for eventually-consistent systems.
//!
//! This crate provides a generic retry engine for tests that observe an
//! asynchronously-converging remote system: repeatedly invoke a fallible
//! fetch operation until a pure predicate over its result becomes true, or
//! a timeout elapses. The engine knows nothing about what is being fetched.
//!
//! Two rules keep the behavior unambiguous:
//!
//! - Errors from the fetch are never retried; they abort the wait
//!   immediately. Only a predicate that evaluates to `false` causes a retry.
//! - "Resource not found" is not an error. A fetch that can observe absence
//!   must return an optional value, so "wait until deleted" is just a
//!   predicate over `None`.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Fixed-interval retry policy for one [`wait`] call.
///
/// A `timeout` of zero means "try exactly once, no retry"; the single
/// attempt still runs to completion before the wait fails or succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between an unsuccessful check and the next fetch.
    pub interval: Duration,
    /// Total budget, measured from just before the first fetch.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy with an explicit interval and timeout.
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// 1s interval, 60s timeout. Suited to fast resource transitions such
    /// as service deletion or pod scheduling.
    pub const fn short() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// 10s interval, 5m timeout. Suited to rollouts and garbage collection.
    pub const fn medium() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5 * 60))
    }

    /// 30s interval, 10m timeout. Suited to namespace teardown.
    pub const fn long() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(10 * 60))
    }
}

/// Why a [`wait`] call did not return a converged value.
#[derive(Debug, Error)]
pub enum RetryError<T, E> {
    /// The predicate never became true within the timeout. Carries the
    /// last observation so callers can report what the system looked like,
    /// not just that time ran out.
    #[error("condition not met within {elapsed:?}")]
    Exhausted {
        /// The result of the final fetch.
        last: T,
        /// Time elapsed since the wait started.
        elapsed: Duration,
    },

    /// The cancellation token fired during an inter-attempt sleep.
    #[error("wait cancelled after {elapsed:?}")]
    Cancelled {
        /// Time elapsed since the wait started.
        elapsed: Duration,
    },

    /// The fetch itself failed. Never retried.
    #[error("fetch failed: {0}")]
    Fetch(E),
}

impl<T, E> RetryError<T, E> {
    /// The last observed value, if the wait ran out of time.
    pub fn last_observed(&self) -> Option<&T> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// Poll `fetch` until `check` accepts its result or `policy.timeout` elapses.
///
/// The first attempt happens immediately; sleeping only occurs between a
/// failed check and the next attempt, so a predicate that is true on the
/// first fetch returns without any delay. The deadline is measured with a
/// monotonic clock.
pub async fn wait<T, E, F, Fut, C>(
    policy: RetryPolicy,
    mut fetch: F,
    check: C,
) -> Result<T, RetryError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&T) -> bool,
{
    let start = Instant::now();
    loop {
        let observed = fetch().await.map_err(RetryError::Fetch)?;
        if check(&observed) {
            return Ok(observed);
        }
        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(RetryError::Exhausted {
                last: observed,
                elapsed,
            });
        }
        sleep(policy.interval).await;
    }
}

/// Like [`wait`], but a cancelled token short-circuits the inter-attempt
/// sleep and surfaces as [`RetryError::Cancelled`], distinct from
/// [`RetryError::Exhausted`].
///
/// A fetch that is already in flight is not interrupted; cancellation is
/// observed between attempts.
pub async fn wait_with_cancel<T, E, F, Fut, C>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
    check: C,
) -> Result<T, RetryError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&T) -> bool,
{
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                elapsed: start.elapsed(),
            });
        }
        let observed = fetch().await.map_err(RetryError::Fetch)?;
        if check(&observed) {
            return Ok(observed);
        }
        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(RetryError::Exhausted {
                last: observed,
                elapsed,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    elapsed: start.elapsed(),
                });
            }
            _ = sleep(policy.interval) => {}
        }
    }
}
