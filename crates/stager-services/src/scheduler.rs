//! Cooperative scheduler — run queue plus node-scoped worker groups.
//!
//! The run queue is FIFO within a request and round-robin across requests,
//! so one large staging job cannot starve the others. High-priority
//! requests have their own rotation that is always served first.
//!
//! Workers are grouped by node context. Malleability events add or revoke
//! whole groups at runtime; revoked workers requeue their in-flight task at
//! its checkpoint offset and exit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use stager_core::plan::TransferTask;
use stager_core::request::Priority;

use crate::engine::{TaskOutcome, TaskSignals, TransferEngine};
use crate::tracker::RequestTracker;

// ── Run queue ─────────────────────────────────────────────────────────────────

/// Shared task queue. Pushes are cheap; pops rotate across requests.
pub struct RunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    /// Request rotation per priority class. A request id appears at most
    /// once per rotation and only while it has queued tasks.
    rotation_high: VecDeque<u64>,
    rotation_normal: VecDeque<u64>,
    tasks: HashMap<u64, PerRequest>,
}

struct PerRequest {
    deque: VecDeque<TransferTask>,
    priority: Priority,
}

impl RunQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, task: TransferTask, priority: Priority) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let id = task.request_id;
            let entry = state.tasks.entry(id).or_insert_with(|| PerRequest {
                deque: VecDeque::new(),
                priority,
            });
            entry.deque.push_back(task);
            if entry.deque.len() == 1 {
                match priority {
                    Priority::High => state.rotation_high.push_back(id),
                    Priority::Normal => state.rotation_normal.push_back(id),
                }
            }
        }
        self.notify.notify_one();
    }

    /// Pop the next task: high rotation first, then normal; the serving
    /// request goes to the back of its rotation if it still has tasks.
    pub(crate) fn pop(&self) -> Option<TransferTask> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let id = if let Some(id) = state.rotation_high.pop_front() {
            id
        } else {
            state.rotation_normal.pop_front()?
        };

        let entry = state.tasks.get_mut(&id)?;
        let task = entry.deque.pop_front()?;
        if entry.deque.is_empty() {
            state.tasks.remove(&id);
        } else {
            match entry.priority {
                Priority::High => state.rotation_high.push_back(id),
                Priority::Normal => state.rotation_normal.push_back(id),
            }
        }
        Some(task)
    }

    /// Await the next task. None once the queue is closed and drained.
    pub async fn next(&self) -> Option<TransferTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop() {
                return Some(task);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.tasks.values().map(|r| r.deque.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Malleability events ───────────────────────────────────────────────────────

/// A change in the job's node allocation, delivered through the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MalleabilityEvent {
    NodeAdded { nodes: Vec<String> },
    NodeRemoved { nodes: Vec<String> },
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler {
    queue: Arc<RunQueue>,
    tracker: RequestTracker,
    engine: Arc<TransferEngine>,
    workers_per_node: u32,
    nodes: DashMap<String, NodeContext>,
    shutdown: broadcast::Sender<()>,
}

struct NodeContext {
    revoked: Arc<AtomicBool>,
    revoke_notify: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<RunQueue>,
        tracker: RequestTracker,
        engine: Arc<TransferEngine>,
        workers_per_node: u32,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            queue,
            tracker,
            engine,
            workers_per_node: workers_per_node.max(1),
            nodes: DashMap::new(),
            shutdown,
        }
    }

    /// Register a node context and spawn its workers. Returns false if the
    /// node is already registered.
    pub fn add_node(&self, node: &str) -> bool {
        if self.nodes.contains_key(node) {
            return false;
        }
        let revoked = Arc::new(AtomicBool::new(false));
        let revoke_notify = Arc::new(Notify::new());

        let workers = (0..self.workers_per_node)
            .map(|i| {
                let worker = Worker {
                    node: node.to_string(),
                    worker_id: i,
                    queue: self.queue.clone(),
                    tracker: self.tracker.clone(),
                    engine: self.engine.clone(),
                    revoked: revoked.clone(),
                    revoke_notify: revoke_notify.clone(),
                };
                tokio::spawn(worker.run(self.shutdown.subscribe()))
            })
            .collect();

        self.nodes.insert(
            node.to_string(),
            NodeContext {
                revoked,
                revoke_notify,
                workers,
            },
        );
        tracing::info!(node, workers = self.workers_per_node, "node context added");
        true
    }

    /// Revoke a node context. Its workers requeue any in-flight task at the
    /// last checkpoint and exit; queued tasks are untouched (the queue is
    /// shared, not per node). Returns false for unknown nodes.
    pub fn remove_node(&self, node: &str) -> bool {
        let Some((_, ctx)) = self.nodes.remove(node) else {
            return false;
        };
        ctx.revoked.store(true, Ordering::SeqCst);
        ctx.revoke_notify.notify_waiters();
        tracing::info!(node, "node context revoked, in-flight tasks will requeue");
        // Workers unwind cooperatively; handles are dropped, not awaited.
        drop(ctx.workers);
        true
    }

    pub fn apply(&self, event: MalleabilityEvent) -> usize {
        match event {
            MalleabilityEvent::NodeAdded { nodes } => {
                nodes.iter().filter(|n| self.add_node(n)).count()
            }
            MalleabilityEvent::NodeRemoved { nodes } => {
                nodes.iter().filter(|n| self.remove_node(n)).count()
            }
        }
    }

    /// (node, workers) pairs for status reporting.
    pub fn nodes(&self) -> Vec<(String, u32)> {
        let mut out: Vec<(String, u32)> = self
            .nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().workers.len() as u32))
            .collect();
        out.sort();
        out
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct Worker {
    node: String,
    worker_id: u32,
    queue: Arc<RunQueue>,
    tracker: RequestTracker,
    engine: Arc<TransferEngine>,
    revoked: Arc<AtomicBool>,
    revoke_notify: Arc<Notify>,
}

impl Worker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(node = %self.node, worker = self.worker_id, "worker started");
        loop {
            if self.revoked.load(Ordering::SeqCst) {
                tracing::debug!(node = %self.node, worker = self.worker_id, "worker revoked");
                return;
            }

            let task = tokio::select! {
                _ = shutdown.recv() => return,
                _ = self.revoke_notify.notified() => continue,
                t = self.queue.next() => match t {
                    Some(t) => t,
                    None => return, // queue closed
                },
            };

            // Dequeue-side cancellation: tasks of a cancelled or aborted
            // request are never dispatched.
            let Some(cancel) = self.tracker.cancel_flag(task.request_id) else {
                tracing::warn!(request_id = task.request_id, "task for unknown request dropped");
                continue;
            };
            if cancel.load(Ordering::SeqCst) {
                self.engine.discard_cancelled(&task);
                continue;
            }

            let signals = TaskSignals::new(cancel, self.revoked.clone());
            let outcome = self.engine.execute(task.clone(), &signals).await;

            if let TaskOutcome::Requeued(resume_offset) = outcome {
                let priority = self
                    .tracker
                    .request(task.request_id)
                    .map(|r| r.priority)
                    .unwrap_or_default();
                let mut task = task;
                task.resume_offset = resume_offset;
                self.tracker.mark_requeued(task.request_id, task.index);
                tracing::info!(
                    request_id = task.request_id,
                    task_index = task.index,
                    resume_offset,
                    remaining = task.remaining(),
                    node = %self.node,
                    "task requeued after node revocation"
                );
                self.queue.push(task, priority);
            }
        }
    }
}
