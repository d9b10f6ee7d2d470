//! Reconciliation loop primitives.
//!
//! Controllers that drive an external backend toward desired state share two
//! needs that this library covers:
//!
//! - **Bounded retries**: a call to a flaky backend is retried with a fixed
//!   delay for a fixed total duration, never indefinitely, and gives up early
//!   when the caller is cancelled.
//! - **Failure tracking**: a resource that keeps failing pass after pass is
//!   reported louder than one that failed once.
//!
//! # Invariants
//!
//! - The first attempt is always made immediately
//! - No attempt starts after the strategy's total duration has elapsed
//! - Cancellation is observed before every attempt and during every delay

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default total duration for a provider call.
pub const DEFAULT_ATTEMPT_TOTAL: Duration = Duration::from_secs(5);

/// Default delay between attempts of a provider call.
pub const DEFAULT_ATTEMPT_DELAY: Duration = Duration::from_millis(200);

/// Default number of consecutive failures before a resource is reported as stuck.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default failure tracking window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// Attempt Strategy
// =============================================================================

/// Retry schedule with a fixed total duration and a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStrategy {
    /// Total time after which no new attempt is started.
    pub total: Duration,

    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl Default for AttemptStrategy {
    fn default() -> Self {
        Self {
            total: DEFAULT_ATTEMPT_TOTAL,
            delay: DEFAULT_ATTEMPT_DELAY,
        }
    }
}

impl AttemptStrategy {
    pub const fn new(total: Duration, delay: Duration) -> Self {
        Self { total, delay }
    }

    /// Begin a sequence of attempts.
    pub fn start(&self) -> Attempt {
        Attempt {
            strategy: *self,
            end: Instant::now() + self.total,
            count: 0,
        }
    }
}

/// One running sequence of attempts.
#[derive(Debug)]
pub struct Attempt {
    strategy: AttemptStrategy,
    end: Instant,
    count: u32,
}

impl Attempt {
    /// Wait until the next attempt may start.
    ///
    /// Returns `false` once the strategy is exhausted or `cancel` fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.count == 0 {
            self.count = 1;
            return true;
        }
        if Instant::now() + self.strategy.delay > self.end {
            return false;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.strategy.delay) => {}
        }
        self.count += 1;
        true
    }

    /// Number of attempts started so far.
    pub fn count(&self) -> u32 {
        self.count
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Why a retried operation did not produce a value.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The caller was cancelled before the operation succeeded.
    #[error("cancelled")]
    Cancelled,

    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The operation failed with an error that retrying won't fix.
    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// Returns the underlying backend error, if there is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Run `op` under `strategy`, retrying errors for which `is_transient` holds.
///
/// Each attempt is raced against `cancel`, so a wedged backend call is
/// abandoned as soon as the caller is cancelled.
pub async fn retry<T, E, F, Fut, P>(
    strategy: &AttemptStrategy,
    cancel: &CancellationToken,
    is_transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = strategy.start();
    let mut last = None;

    while attempt.next(cancel).await {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                debug!(attempt = attempt.count(), "Transient failure, retrying");
                last = Some(e);
            }
            Err(e) => return Err(RetryError::Permanent(e)),
        }
    }

    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled);
    }
    match last {
        Some(last) => Err(RetryError::Exhausted {
            attempts: attempt.count(),
            last,
        }),
        None => Err(RetryError::Cancelled),
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Tracks consecutive failures per resource across reconciliation passes.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated before a resource counts as exhausted.
    max_retries: u32,

    /// Failures older than this are forgotten.
    window: Duration,

    /// resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if the resource has now exceeded its retries.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Forget a resource's failures (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of resources with recorded failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
