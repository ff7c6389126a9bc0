//! Request tracking — the state machine behind every staging request.
//!
//! One entry per request, holding per-task slots. Task updates drive the
//! request state: `Pending → Running → {Completed, Failed, Cancelled}`,
//! with a degraded flag when chunks failed under the best-effort policy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use stager_core::plan::TransferTask;
use stager_core::request::{FailurePolicy, RequestState, StagingRequest, TaskState, TransferMode};
use stager_core::ErrorKind;

/// Shared, clone-able handle to the request table.
#[derive(Clone)]
pub struct RequestTracker {
    requests: Arc<DashMap<u64, RequestEntry>>,
    next_id: Arc<AtomicU64>,
}

struct RequestEntry {
    request: StagingRequest,
    tasks: Vec<TaskSlot>,
    state: RequestState,
    degraded: bool,
    /// Cooperative cancellation flag. Tasks observe it at block boundaries;
    /// the scheduler observes it at dequeue.
    cancel: Arc<AtomicBool>,
    /// Whether Move-mode finalization (source unlink) already ran.
    finalized: AtomicBool,
    bytes_total: u64,
    started_at: Instant,
    finished_at: Option<Instant>,
}

struct TaskSlot {
    state: TaskState,
    bytes_done: u64,
    len: u64,
    error: Option<(ErrorKind, String)>,
}

/// Snapshot returned by `status` and listed by the API.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub id: u64,
    pub state: RequestState,
    pub degraded: bool,
    /// 0.0–100.0, bytes transferred over bytes planned.
    pub progress_pct: f32,
    /// Aggregate bandwidth in MB/s, frozen once the request finishes.
    pub bw_mbps: f32,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub errors: Vec<TaskErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorInfo {
    pub task_index: u32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of a cancel call. Cancellation is idempotent; only the first call
/// flips the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This call set the cancellation flag.
    Cancelled,
    /// The flag was already set by an earlier call.
    AlreadyCancelling,
    /// The request already reached a terminal state.
    AlreadyFinished,
    NotFound,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an accepted request together with its planned tasks.
    pub fn register(&self, request: StagingRequest, tasks: &[TransferTask]) {
        let slots: Vec<TaskSlot> = tasks
            .iter()
            .map(|t| TaskSlot {
                state: TaskState::Pending,
                bytes_done: t.resume_offset,
                len: t.len,
                error: None,
            })
            .collect();
        let bytes_total = tasks.iter().map(|t| t.len).sum();

        tracing::info!(
            request_id = request.id,
            tasks = slots.len(),
            bytes_total,
            "request registered"
        );

        self.requests.insert(
            request.id,
            RequestEntry {
                request,
                tasks: slots,
                state: RequestState::Pending,
                degraded: false,
                cancel: Arc::new(AtomicBool::new(false)),
                finalized: AtomicBool::new(false),
                bytes_total,
                started_at: Instant::now(),
                finished_at: None,
            },
        );
    }

    /// The cancellation flag tasks and the scheduler poll for this request.
    pub fn cancel_flag(&self, id: u64) -> Option<Arc<AtomicBool>> {
        self.requests.get(&id).map(|e| e.cancel.clone())
    }

    pub fn request(&self, id: u64) -> Option<StagingRequest> {
        self.requests.get(&id).map(|e| e.request.clone())
    }

    /// Record a task state change and recompute the request state.
    /// Returns the request state after the update.
    pub fn update_task(
        &self,
        id: u64,
        task_index: u32,
        state: TaskState,
        error: Option<(ErrorKind, String)>,
    ) -> Option<RequestState> {
        let mut entry = self.requests.get_mut(&id)?;
        let idx = task_index as usize;
        if idx >= entry.tasks.len() {
            tracing::error!(request_id = id, task_index, "task index out of range");
            return Some(entry.state);
        }

        entry.tasks[idx].state = state;
        if state == TaskState::Completed {
            let len = entry.tasks[idx].len;
            entry.tasks[idx].bytes_done = len;
        }
        if let Some(err) = error {
            tracing::warn!(
                request_id = id,
                task_index,
                kind = %err.0,
                message = %err.1,
                "task error recorded"
            );
            entry.tasks[idx].error = Some(err);
        }

        Self::recompute(&mut entry);
        Some(entry.state)
    }

    /// Record a mid-task checkpoint: bytes transferred so far for one task.
    /// Requeued tasks resume from this offset.
    pub fn checkpoint(&self, id: u64, task_index: u32, bytes_done: u64) {
        if let Some(mut entry) = self.requests.get_mut(&id) {
            if let Some(slot) = entry.tasks.get_mut(task_index as usize) {
                slot.bytes_done = bytes_done;
            }
        }
    }

    /// A task was requeued (node removal); it goes back to Pending without
    /// losing its checkpoint.
    pub fn mark_requeued(&self, id: u64, task_index: u32) {
        if let Some(mut entry) = self.requests.get_mut(&id) {
            if let Some(slot) = entry.tasks.get_mut(task_index as usize) {
                slot.state = TaskState::Pending;
            }
        }
    }

    fn recompute(entry: &mut RequestEntry) {
        if entry.state.is_terminal() {
            return;
        }

        let policy = entry.request.policy;
        let any_running = entry
            .tasks
            .iter()
            .any(|t| t.state == TaskState::Running);
        let all_terminal = entry.tasks.iter().all(|t| t.state.is_terminal());
        let any_failed = entry.tasks.iter().any(|t| t.state == TaskState::Failed);
        let any_completed = entry.tasks.iter().any(|t| t.state == TaskState::Completed);
        let any_cancelled = entry.tasks.iter().any(|t| t.state == TaskState::Cancelled);

        // Degraded is a sub-state of Running/Completed under best-effort.
        if any_failed && policy == FailurePolicy::BestEffort {
            entry.degraded = true;
        }

        // Abort-on-first-failure: the first terminal task failure fails the
        // request immediately and raises the cancel flag so the scheduler
        // drops everything still queued.
        if any_failed && policy == FailurePolicy::AbortOnFirstFailure {
            entry.state = RequestState::Failed;
            entry.cancel.store(true, Ordering::SeqCst);
            entry.finished_at = Some(Instant::now());
            tracing::warn!(request_id = entry.request.id, "request failed (abort policy)");
            return;
        }

        if !all_terminal {
            if any_running || entry.tasks.iter().any(|t| t.state.is_terminal()) {
                entry.state = RequestState::Running;
            }
            return;
        }

        // Every task resolved — finalize. A cancel flag raised after the
        // last task already completed does not rewrite history.
        entry.state = if any_failed && !any_completed {
            RequestState::Failed
        } else if any_cancelled {
            RequestState::Cancelled
        } else {
            // Best-effort with partial failures lands here as
            // Completed + degraded.
            RequestState::Completed
        };
        entry.finished_at = Some(Instant::now());
        tracing::info!(
            request_id = entry.request.id,
            state = ?entry.state,
            degraded = entry.degraded,
            "request finished"
        );
    }

    /// Request cancellation. Sets the cooperative flag exactly once; the
    /// request finalizes to Cancelled after all outstanding tasks unwind.
    pub fn cancel(&self, id: u64) -> CancelOutcome {
        let Some(entry) = self.requests.get(&id) else {
            return CancelOutcome::NotFound;
        };
        if entry.state.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        if entry.cancel.swap(true, Ordering::SeqCst) {
            CancelOutcome::AlreadyCancelling
        } else {
            tracing::info!(request_id = id, "cancellation requested");
            CancelOutcome::Cancelled
        }
    }

    /// Returns the request exactly once when it has completed, for Move-mode
    /// source cleanup. Subsequent calls return None.
    pub fn take_finalize(&self, id: u64) -> Option<StagingRequest> {
        let entry = self.requests.get(&id)?;
        if entry.state != RequestState::Completed {
            return None;
        }
        if entry.request.mode != TransferMode::Move {
            return None;
        }
        if entry.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(entry.request.clone())
    }

    pub fn status(&self, id: u64) -> Option<RequestStatus> {
        self.requests.get(&id).map(|e| Self::snapshot(&e))
    }

    pub fn list(&self) -> Vec<RequestStatus> {
        let mut out: Vec<RequestStatus> =
            self.requests.iter().map(|e| Self::snapshot(&e)).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Drop a finished request from the table.
    pub fn remove(&self, id: u64) -> bool {
        self.requests.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn snapshot(entry: &RequestEntry) -> RequestStatus {
        let bytes_done: u64 = entry.tasks.iter().map(|t| t.bytes_done).sum();
        let progress_pct = if entry.bytes_total == 0 {
            if entry.state.is_terminal() { 100.0 } else { 0.0 }
        } else {
            (bytes_done as f32 / entry.bytes_total as f32) * 100.0
        };

        let elapsed = entry
            .finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(entry.started_at)
            .as_secs_f32()
            .max(f32::EPSILON);
        let bw_mbps = (bytes_done as f32 / (1024.0 * 1024.0)) / elapsed;

        let errors = entry
            .tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                t.error.as_ref().map(|(kind, message)| TaskErrorInfo {
                    task_index: i as u32,
                    kind: *kind,
                    message: message.clone(),
                })
            })
            .collect();

        RequestStatus {
            id: entry.request.id,
            state: entry.state,
            degraded: entry.degraded,
            progress_pct,
            bw_mbps,
            tasks_total: entry.tasks.len(),
            tasks_completed: entry
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .count(),
            errors,
        }
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
