use std::time::Duration;

use stager_core::request::{Dataset, FailurePolicy, Priority, RequestState, TransferMode};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Failure policies
// ══════════════════════════════════════════════════════════════════════════════

/// Transient transport errors are retried with backoff; the request still
/// completes and the retried bytes land correctly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_errors_are_absorbed_by_retry() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let data = pattern(128);
    stack.mock.put("/pfs/flaky", data.clone());
    stack.mock.fail_next("/bb/flaky", 2);

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/flaky")],
            vec![Dataset::posix("/bb/flaky")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert!(status.errors.is_empty());
    assert_eq!(stack.mock.get("/bb/flaky").unwrap(), data);
}

/// Under abort-on-first-failure a permanently failing dataset fails the
/// whole request, and tasks still queued are cancelled instead of run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_policy_stops_remaining_tasks() {
    // One worker so task order is sequential and deterministic.
    let stack = stack_with(&["n1"], 1, small_opts());
    stack.mock.put("/pfs/bad", pattern(160)); // 5 tasks
    stack.mock.fail_next("/bb/bad", u32::MAX);

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/bad")],
            vec![Dataset::posix("/bb/bad")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.tasks_completed, 0);
    assert!(!status.errors.is_empty());
    // Only the first task ever ran; the rest were cancelled at dequeue.
    assert_eq!(status.errors.len(), 1, "{:?}", status.errors);
    wait_until(Duration::from_secs(2), "queue drained", || {
        stack.queue.is_empty()
    })
    .await;
}

/// Best-effort keeps going past a failed dataset: the healthy dataset is
/// staged byte-identically and the request completes degraded, with the
/// failure recorded per task.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn best_effort_completes_degraded() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let good = pattern(96);
    stack.mock.put("/pfs/good", good.clone());
    stack.mock.put("/pfs/bad", pattern(32));
    stack.mock.fail_next("/bb/bad", u32::MAX);

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/good"), Dataset::posix("/pfs/bad")],
            vec![Dataset::posix("/bb/good"), Dataset::posix("/bb/bad")],
            TransferMode::Copy,
            FailurePolicy::BestEffort,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert!(status.degraded);
    assert!(!status.errors.is_empty());
    assert_eq!(stack.mock.get("/bb/good").unwrap(), good);
}

/// A best-effort request where every task fails is a plain failure, not a
/// degraded success.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn best_effort_with_nothing_staged_fails() {
    let stack = stack_with(&["n1"], 1, small_opts());
    stack.mock.put("/pfs/doomed", pattern(32)); // one task
    stack.mock.fail_next("/bb/doomed", u32::MAX);

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/doomed")],
            vec![Dataset::posix("/bb/doomed")],
            TransferMode::Copy,
            FailurePolicy::BestEffort,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Failed);
}

/// A failed Move must not unlink its sources.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_move_keeps_sources() {
    let stack = stack_with(&["n1"], 1, small_opts());
    stack.mock.put("/pfs/keep", pattern(32));
    stack.mock.fail_next("/bb/keep", u32::MAX);

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/keep")],
            vec![Dataset::posix("/bb/keep")],
            TransferMode::Move,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Failed);
    assert!(stack.mock.exists("/pfs/keep"));
}
