use std::time::Duration;

use stager_core::request::{Dataset, FailurePolicy, Priority, RequestState, TransferMode};
use stager_services::{CancelOutcome, EngineOptions};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation
// ══════════════════════════════════════════════════════════════════════════════

/// Shaped down so the transfer takes seconds.
fn slow_opts() -> EngineOptions {
    EngineOptions {
        default_bytes_per_sec: 64,
        ..small_opts()
    }
}

/// Cancel lands while the request is in flight; running tasks stop at the
/// next block boundary and queued tasks never start. The first cancel call
/// wins; repeats are reported as such.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_observed_and_exactly_once() {
    let stack = stack_with(&["n1"], 1, slow_opts());
    stack.mock.put("/pfs/slow", pattern(512));

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/slow")],
            vec![Dataset::posix("/bb/slow")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();
    let id = request.id;

    // Wait until a worker picked the first task up.
    wait_until(Duration::from_secs(5), "request running", || {
        stack
            .tracker
            .status(id)
            .map(|s| s.state == RequestState::Running)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(stack.tracker.cancel(id), CancelOutcome::Cancelled);
    // The flag is already up; a second cancel must not re-cancel.
    assert_ne!(stack.tracker.cancel(id), CancelOutcome::Cancelled);

    let status = wait_terminal(&stack.tracker, id, Duration::from_secs(10)).await;
    assert_eq!(status.state, RequestState::Cancelled);
    assert!(status.tasks_completed < status.tasks_total);

    // The last outstanding task is dropped at the dequeue-side check; the
    // request's shaping bucket must still be released.
    wait_until(Duration::from_secs(5), "shaping bucket released", || {
        stack.shaping.limit(id).is_none()
    })
    .await;

    // Settled requests reject further cancels.
    assert_eq!(stack.tracker.cancel(id), CancelOutcome::AlreadyFinished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_unknown_request_is_not_found() {
    let stack = stack_with(&["n1"], 1, small_opts());
    assert_eq!(stack.tracker.cancel(999), CancelOutcome::NotFound);
}

/// Cancelling after completion does not change the outcome.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_after_completion_is_a_noop() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let data = pattern(64);
    stack.mock.put("/pfs/done", data.clone());

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/done")],
            vec![Dataset::posix("/bb/done")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);

    assert_eq!(
        stack.tracker.cancel(request.id),
        CancelOutcome::AlreadyFinished
    );
    let after = stack.tracker.status(request.id).unwrap();
    assert_eq!(after.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/done").unwrap(), data);
}
