use std::time::Duration;

use stager_core::request::{Dataset, FailurePolicy, Priority, RequestState, TransferMode};
use stager_services::{EngineOptions, MalleabilityEvent};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Malleability
// ══════════════════════════════════════════════════════════════════════════════

fn slow_opts() -> EngineOptions {
    EngineOptions {
        default_bytes_per_sec: 64,
        ..small_opts()
    }
}

/// Removing the only node mid-transfer requeues the in-flight task at its
/// checkpoint; a node added afterwards picks it up and the target comes out
/// byte-identical.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_node_requeues_and_new_node_finishes() {
    let stack = stack_with(&["n1"], 1, slow_opts());
    let data = pattern(256);
    stack.mock.put("/pfs/moving-target", data.clone());

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/moving-target")],
            vec![Dataset::posix("/bb/moving-target")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();
    let id = request.id;

    wait_until(Duration::from_secs(5), "request running", || {
        stack
            .tracker
            .status(id)
            .map(|s| s.state == RequestState::Running)
            .unwrap_or(false)
    })
    .await;

    assert!(stack.scheduler.remove_node("n1"));
    assert!(stack.scheduler.nodes().is_empty());

    // Nobody is working; the request must not settle on its own.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stack.tracker.status(id).unwrap().state.is_terminal());

    // Lift the shaping limit so the replacement node finishes quickly.
    stack.shaping.clear(id);
    assert!(stack.scheduler.add_node("n2"));

    let status = wait_terminal(&stack.tracker, id, Duration::from_secs(10)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/moving-target").unwrap(), data);
}

/// Node bookkeeping: duplicates are rejected, unknown removals are ignored,
/// and events report how many contexts actually changed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_events_are_idempotent() {
    let stack = stack_with(&["n1"], 2, small_opts());

    let added = stack.scheduler.apply(MalleabilityEvent::NodeAdded {
        nodes: vec!["n1".into(), "n2".into()],
    });
    assert_eq!(added, 1, "n1 already exists, only n2 is new");
    assert_eq!(stack.scheduler.nodes().len(), 2);

    let removed = stack.scheduler.apply(MalleabilityEvent::NodeRemoved {
        nodes: vec!["n2".into(), "ghost".into()],
    });
    assert_eq!(removed, 1);
    assert_eq!(stack.scheduler.nodes().len(), 1);
}

/// Work submitted while no nodes are registered sits in the queue and runs
/// as soon as capacity arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_waits_for_first_node() {
    let stack = stack_with(&[], 2, small_opts());
    let data = pattern(64);
    stack.mock.put("/pfs/parked", data.clone());

    let request = stack
        .engine
        .submit(
            vec![Dataset::posix("/pfs/parked")],
            vec![Dataset::posix("/bb/parked")],
            TransferMode::Copy,
            FailurePolicy::AbortOnFirstFailure,
            Priority::Normal,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stack.tracker.status(request.id).unwrap().state, RequestState::Pending);
    assert!(stack.queue.len() > 0);

    stack.scheduler.add_node("late");
    let status = wait_terminal(&stack.tracker, request.id, Duration::from_secs(5)).await;
    assert_eq!(status.state, RequestState::Completed);
    assert_eq!(stack.mock.get("/bb/parked").unwrap(), data);
}
