//! Tests for the operation poller and readiness wait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::{fixture, rstest};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{PollError, ReadinessWait, wait_for_operation};
use crate::backend::{BackendErrorKind, Classify, OperationStatus};
use crate::backoff::BackoffPolicy;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind:?}")]
struct FetchError {
    kind: BackendErrorKind,
}

impl Classify for FetchError {
    fn kind(&self) -> BackendErrorKind {
        self.kind
    }
}

/// The paused clock advances in whole-millisecond timer ticks.
const TIMER_SLACK: Duration = Duration::from_millis(1);

type Script = Arc<Mutex<VecDeque<Result<OperationStatus, FetchError>>>>;

#[derive(Clone, Default)]
struct ScriptedFetch {
    script: Script,
    calls: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedFetch {
    fn with(statuses: impl IntoIterator<Item = Result<OperationStatus, FetchError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(statuses.into_iter().collect())),
            calls: Arc::default(),
        }
    }

    fn pending_then_done(pending: usize) -> Self {
        Self::with(
            std::iter::repeat_n(Ok(OperationStatus::Pending), pending)
                .chain(std::iter::once(Ok(OperationStatus::Done))),
        )
    }

    async fn next(&self) -> Result<OperationStatus, FetchError> {
        self.calls
            .lock()
            .unwrap_or_else(|err| panic!("calls lock: {err}"))
            .push(Instant::now());
        self.script
            .lock()
            .unwrap_or_else(|err| panic!("script lock: {err}"))
            .pop_front()
            .unwrap_or(Ok(OperationStatus::Pending))
    }

    fn sleeps(&self) -> Vec<Duration> {
        let calls = self
            .calls
            .lock()
            .unwrap_or_else(|err| panic!("calls lock: {err}"));
        calls
            .windows(2)
            .map(|pair| match pair {
                [earlier, later] => later.duration_since(*earlier),
                _ => Duration::ZERO,
            })
            .collect()
    }
}

#[fixture]
fn policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_interval: Duration::from_secs(1),
        randomization_factor: 0.5,
        multiplier: 2.0,
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Duration::from_secs(120),
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(5)]
#[tokio::test(start_paused = true)]
async fn performs_one_sleep_per_pending_status(policy: BackoffPolicy, #[case] pending: usize) {
    let fetch = ScriptedFetch::pending_then_done(pending);
    let cancel = CancellationToken::new();

    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    assert!(result.is_ok(), "unexpected outcome: {result:?}");
    let sleeps = fetch.sleeps();
    assert_eq!(sleeps.len(), pending);

    let mut centre = policy.initial_interval;
    let mut total = Duration::ZERO;
    for slept in sleeps {
        let low = centre.mul_f64(0.5).min(policy.max_interval);
        let high = centre.mul_f64(1.5).min(policy.max_interval) + TIMER_SLACK;
        assert!(
            slept >= low && slept <= high,
            "{slept:?} outside [{low:?}, {high:?}]"
        );
        total += slept;
        centre = centre.mul_f64(2.0).min(policy.max_interval);
    }
    assert!(total <= policy.max_elapsed_time + TIMER_SLACK * 8);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn times_out_when_done_never_arrives(policy: BackoffPolicy) {
    let fetch = ScriptedFetch::default();
    let cancel = CancellationToken::new();

    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    let Err(PollError::Timeout { elapsed }) = result else {
        panic!("expected timeout, got {result:?}");
    };
    assert!(elapsed <= policy.max_elapsed_time);
    let total: Duration = fetch.sleeps().into_iter().sum();
    assert!(total <= policy.max_elapsed_time + TIMER_SLACK * 64);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn embedded_failure_is_terminal(policy: BackoffPolicy) {
    let fetch = ScriptedFetch::with([
        Ok(OperationStatus::Pending),
        Ok(OperationStatus::Failed(String::from("QUOTA_EXCEEDED"))),
        Ok(OperationStatus::Done),
    ]);
    let cancel = CancellationToken::new();

    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    assert!(
        matches!(result, Err(PollError::Failed(ref detail)) if detail == "QUOTA_EXCEEDED"),
        "unexpected outcome: {result:?}"
    );
    assert_eq!(fetch.sleeps().len(), 1);
}

#[tokio::test]
async fn missing_policy_fails_before_fetching() {
    let fetch = ScriptedFetch::pending_then_done(3);
    let cancel = CancellationToken::new();

    let result = wait_for_operation(None, &cancel, || fetch.next()).await;

    assert!(matches!(result, Err(PollError::MissingPolicy)));
    assert!(fetch.sleeps().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn not_found_is_treated_as_pending(policy: BackoffPolicy) {
    let fetch = ScriptedFetch::with([
        Err(FetchError {
            kind: BackendErrorKind::NotFound,
        }),
        Ok(OperationStatus::Done),
    ]);
    let cancel = CancellationToken::new();

    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    assert!(result.is_ok(), "unexpected outcome: {result:?}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn other_fetch_errors_propagate(policy: BackoffPolicy) {
    let fetch = ScriptedFetch::with([Err(FetchError {
        kind: BackendErrorKind::Unauthorized,
    })]);
    let cancel = CancellationToken::new();

    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    assert!(matches!(result, Err(PollError::Backend(_))));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_sleep(policy: BackoffPolicy) {
    let fetch = ScriptedFetch::default();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = wait_for_operation(Some(&policy), &cancel, || fetch.next()).await;

    assert!(matches!(result, Err(PollError::Cancelled)));
    assert!(started.elapsed() < policy.max_elapsed_time);
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_returns_first_value() {
    let wait = ReadinessWait {
        attempts: 5,
        interval: Duration::from_secs(3),
    };
    let cancel = CancellationToken::new();
    let answers = Arc::new(Mutex::new(VecDeque::from([
        Ok(None),
        Err(FetchError {
            kind: BackendErrorKind::NotFound,
        }),
        Ok(Some("198.51.100.7")),
    ])));

    let result = wait
        .until(&cancel, || {
            let answers = Arc::clone(&answers);
            async move {
                answers
                    .lock()
                    .unwrap_or_else(|err| panic!("answers lock: {err}"))
                    .pop_front()
                    .unwrap_or(Ok(None))
            }
        })
        .await;

    assert_eq!(result.ok(), Some("198.51.100.7"));
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_times_out_after_last_attempt() {
    let wait = ReadinessWait {
        attempts: 3,
        interval: Duration::from_secs(2),
    };
    let cancel = CancellationToken::new();

    let result: Result<(), PollError<FetchError>> =
        wait.until(&cancel, || async { Ok(None) }).await;

    let Err(PollError::Timeout { elapsed }) = result else {
        panic!("expected timeout, got {result:?}");
    };
    assert_eq!(elapsed, Duration::from_secs(4));
}
