use std::time::Duration;

use stager_core::request::{Dataset, FailurePolicy, Priority, RequestState, TransferMode};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Staging happy paths
// ══════════════════════════════════════════════════════════════════════════════

/// A 320-byte dataset at a 32-byte chunk size becomes ten tasks. All of them
/// run across two workers and the target is byte-identical to the source.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_chunk_copy_is_byte_identical() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let data = pattern(320);
    stack.mock.put("/pfs/job/input.dat", data.clone());

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/job/input.dat")],
            vec![Dataset::posix("/bb/input.dat")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert!(!status.degraded);
    assert_eq!(status.tasks_total, 10);
    assert_eq!(status.tasks_completed, 10);
    assert_eq!(status.progress_pct, 100.0);
    assert_eq!(stack.mock.get("/bb/input.dat").unwrap(), data);
}

/// One request staging several datasets; contiguous task indices span files.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_dataset_request_stages_all_files() {
    let stack = stack_with(&["n1"], 4, small_opts());
    let a = pattern(100);
    let b = pattern(50);
    let c: Vec<u8> = Vec::new();
    stack.mock.put("/pfs/a", a.clone());
    stack.mock.put("/pfs/b", b.clone());
    stack.mock.put("/pfs/c", c.clone());

    let request = stack
        .engine
        .submit(
            vec![
                Dataset::posix("/pfs/a"),
                Dataset::posix("/pfs/b"),
                Dataset::posix("/pfs/c"),
            ],
            vec![
                Dataset::posix("/bb/a"),
                Dataset::posix("/bb/b"),
                Dataset::posix("/bb/c"),
            ],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/a").unwrap(), a);
    assert_eq!(stack.mock.get("/bb/b").unwrap(), b);
    // Empty datasets still materialize an empty target.
    assert!(stack.mock.exists("/bb/c"));
    assert_eq!(stack.mock.get("/bb/c").unwrap(), c);
}

/// Move behaves like copy and then unlinks the sources, exactly once,
/// only after every task completed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_request_unlinks_sources() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let data = pattern(96);
    stack.mock.put("/pfs/move.dat", data.clone());

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/move.dat")],
            vec![Dataset::posix("/bb/move.dat")],
            TransferMode::Move,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/move.dat").unwrap(), data);
    assert!(!stack.mock.exists("/pfs/move.dat"));
}

/// Submissions that cannot possibly run are rejected synchronously and
/// leave no trace in the tracker or the queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_submissions_fail_fast() {
    let stack = stack_with(&["n1"], 1, small_opts());
    stack.mock.put("/pfs/ok", pattern(10));

    // missing source
    assert!(stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/missing")],
            vec![Dataset::posix("/bb/missing")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .is_err());

    // source/target count mismatch
    assert!(stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/ok")],
            vec![Dataset::posix("/bb/x"), Dataset::posix("/bb/y")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .is_err());

    assert!(stack.tracker.is_empty());
    assert_eq!(stack.queue.len(), 0);
}

/// Two concurrent requests make interleaved progress; a high-priority
/// request is never starved behind a normal one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_both_complete() {
    let stack = stack_with(&["n1"], 2, small_opts());
    let big = pattern(512);
    let small = pattern(64);
    stack.mock.put("/pfs/big", big.clone());
    stack.mock.put("/pfs/small", small.clone());

    let r1 = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/big")],
            vec![Dataset::posix("/bb/big")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();
    let r2 = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/small")],
            vec![Dataset::posix("/bb/small")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::High,
        )
        .unwrap();

    let s1 = wait_terminal(&stack.tracker, r1.id, Duration::from_secs(5)).await;
    let s2 = wait_terminal(&stack.tracker, r2.id, Duration::from_secs(5)).await;
    assert_eq!(s1.state, RequestState::Completed);
    assert_eq!(s2.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/big").unwrap(), big);
    assert_eq!(stack.mock.get("/bb/small").unwrap(), small);
}
