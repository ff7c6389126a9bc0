//! Stager integration test harness.
//!
//! Tests drive the full in-process stack — scheduler workers, transfer
//! engine, tracker, shaping — over the mock transport, so they exercise
//! the same code paths as a running daemon without touching a filesystem
//! or network. Each test builds its own stack; nothing is shared.

use std::sync::Arc;
use std::time::Duration;

use stager_core::request::RequestState;
use stager_services::{
    EngineOptions, MockTransport, RequestStatus, RequestTracker, RunQueue, Scheduler, ShapingGate,
    TransferEngine,
};
use tokio::sync::broadcast;

mod cancellation;
mod failures;
mod malleability;
mod staging;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct TestStack {
    pub mock: Arc<MockTransport>,
    pub tracker: RequestTracker,
    pub queue: Arc<RunQueue>,
    pub shaping: ShapingGate,
    pub engine: Arc<TransferEngine>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: broadcast::Sender<()>,
}

/// Small chunks and blocks so a few hundred bytes produce many tasks.
pub fn small_opts() -> EngineOptions {
    EngineOptions {
        chunk_size: 32,
        io_block_size: 16,
        max_attempts: 3,
        backoff: Duration::from_millis(1),
        default_bytes_per_sec: 0,
    }
}

/// Build a full stack with worker groups for the named nodes.
/// Must run inside a tokio runtime — workers are spawned immediately.
pub fn stack_with(nodes: &[&str], workers_per_node: u32, opts: EngineOptions) -> TestStack {
    let mock = Arc::new(MockTransport::new());
    let tracker = RequestTracker::new();
    let queue = RunQueue::new();
    let shaping = ShapingGate::new();
    let engine = Arc::new(TransferEngine::new(
        mock.clone(),
        tracker.clone(),
        queue.clone(),
        shaping.clone(),
        opts,
    ));
    let (shutdown, _) = broadcast::channel(1);
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        tracker.clone(),
        engine.clone(),
        workers_per_node,
        shutdown.clone(),
    ));
    for node in nodes {
        assert!(scheduler.add_node(node));
    }
    TestStack {
        mock,
        tracker,
        queue,
        shaping,
        engine,
        scheduler,
        shutdown,
    }
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.queue.close();
        let _ = self.shutdown.send(());
    }
}

/// Poll until the request reaches a terminal state.
pub async fn wait_terminal(tracker: &RequestTracker, id: u64, timeout: Duration) -> RequestStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(status) = tracker.status(id) {
            if status.state.is_terminal() {
                return status;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request {id} did not settle within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an arbitrary condition.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Smoke ─────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stack_comes_up_and_drains() {
    let stack = stack_with(&["n1"], 2, small_opts());
    assert_eq!(stack.scheduler.nodes().len(), 1);
    assert_eq!(stack.scheduler.queued_tasks(), 0);
    assert!(stack.tracker.is_empty());
    assert_eq!(RequestState::Pending.is_terminal(), false);
}
