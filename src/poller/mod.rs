//! Waiting for asynchronous backend work to settle.
//!
//! [`wait_for_operation`] drives a caller-supplied status fetch under a
//! [`BackoffPolicy`]. [`ReadinessWait`] is a separate fixed-interval wait
//! used where resources lag behind operation completion (public addresses,
//! freshly created security groups). Both race every sleep against a
//! [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{Classify, ComputeBackend, Operation, OperationStatus};
use crate::backoff::BackoffPolicy;

const READINESS_ATTEMPTS: u32 = 60;
const READINESS_INTERVAL: Duration = Duration::from_secs(3);

/// Failures raised while waiting.
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised before any sleep when no backoff policy is configured.
    #[error("operation backoff policy is not configured")]
    MissingPolicy,
    /// Raised when the backoff budget is exhausted.
    #[error("maximum backoff elapsed time exceeded after {elapsed:?}")]
    Timeout {
        /// Time spent waiting before giving up.
        elapsed: Duration,
    },
    /// Raised when the caller cancels the wait.
    #[error("wait cancelled")]
    Cancelled,
    /// Raised when the operation completed with an embedded failure.
    #[error("operation error: {0}")]
    Failed(String),
    /// Raised when fetching the status fails with anything but "not found".
    #[error(transparent)]
    Backend(E),
}

/// Polls `fetch` until it reports [`OperationStatus::Done`].
///
/// A fetch that fails with a "not found" classification is treated as
/// pending: freshly issued operations may not be visible yet. An embedded
/// failure is terminal and returned without retrying. Before each sleep the
/// cumulative sleep time is checked so that it never exceeds
/// `max_elapsed_time`.
///
/// # Errors
///
/// Returns [`PollError::MissingPolicy`] without sleeping when `policy` is
/// `None`, [`PollError::Timeout`] when the budget runs out,
/// [`PollError::Cancelled`] when `cancel` fires, [`PollError::Failed`] for
/// embedded operation failures and [`PollError::Backend`] for fetch errors.
pub async fn wait_for_operation<F, Fut, E>(
    policy: Option<&BackoffPolicy>,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationStatus, E>>,
    E: std::error::Error + Classify + 'static,
{
    let budget = policy.ok_or(PollError::MissingPolicy)?;
    let mut backoff = budget.start();
    let mut slept = Duration::ZERO;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        match fetch().await {
            Ok(OperationStatus::Done) => return Ok(()),
            Ok(OperationStatus::Failed(detail)) => return Err(PollError::Failed(detail)),
            Ok(OperationStatus::Pending) => {}
            Err(err) if err.is_not_found() => {
                debug!(error = %err, "operation not visible yet");
            }
            Err(err) => return Err(PollError::Backend(err)),
        }

        let next = backoff.next_interval(&mut rand::rng());
        if slept + next > budget.max_elapsed_time {
            return Err(PollError::Timeout { elapsed: slept });
        }

        debug!(interval = ?next, "operation pending, backing off");
        tokio::select! {
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            () = sleep(next) => {}
        }
        slept += next;
    }
}

/// Fixed-interval bounded wait for a condition that lags behind an
/// operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessWait {
    /// Number of checks before giving up.
    pub attempts: u32,
    /// Sleep between two checks.
    pub interval: Duration,
}

impl Default for ReadinessWait {
    fn default() -> Self {
        Self {
            attempts: READINESS_ATTEMPTS,
            interval: READINESS_INTERVAL,
        }
    }
}

impl ReadinessWait {
    /// Repeatedly evaluates `check` until it yields a value.
    ///
    /// `Ok(None)` and "not found" errors both mean "not ready yet".
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Timeout`] after the last attempt,
    /// [`PollError::Cancelled`] when `cancel` fires and
    /// [`PollError::Backend`] for any other failure of `check`.
    pub async fn until<T, F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut check: F,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let started = Instant::now();
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            match check().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(PollError::Backend(err)),
            }
            if attempt == self.attempts {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(PollError::Cancelled),
                () = sleep(self.interval) => {}
            }
        }
        Err(PollError::Timeout {
            elapsed: started.elapsed(),
        })
    }
}

/// Waiting parameters shared by every step of one driver invocation.
#[derive(Clone, Copy, Debug)]
pub struct WaitContext<'a> {
    /// Backoff policy for operation polling.
    pub policy: Option<&'a BackoffPolicy>,
    /// Fixed-interval wait for lagging resources.
    pub readiness: ReadinessWait,
    /// Cancellation signal observed by every sleep.
    pub cancel: &'a CancellationToken,
}

/// Resolves `operation` to completion against `backend`.
///
/// Operations that are already terminal resolve without polling.
///
/// # Errors
///
/// Propagates the [`PollError`] raised by [`wait_for_operation`], or
/// [`PollError::Failed`] for an operation that already failed.
pub async fn settle<B>(
    backend: &B,
    context: &WaitContext<'_>,
    operation: &Operation,
) -> Result<(), PollError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    match &operation.status {
        OperationStatus::Done => Ok(()),
        OperationStatus::Failed(detail) => Err(PollError::Failed(detail.clone())),
        OperationStatus::Pending => {
            debug!(operation = %operation.id, target = %operation.target, "awaiting operation");
            wait_for_operation(context.policy, context.cancel, || {
                backend.operation(operation)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests;
