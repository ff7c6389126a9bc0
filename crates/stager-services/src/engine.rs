//! Transfer engine: request admission and chunk execution.
//!
//! `submit` validates a request synchronously (endpoint probes, size
//! lookup), plans its chunk tasks and enqueues them. `execute` runs one
//! task to completion on a worker, observing the request's cancel flag
//! and the worker's revocation flag at block boundaries so cancellation
//! and node removal both take effect within one I/O block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stager_core::config::StagerConfig;
use stager_core::plan::{plan_request, TransferTask};
use stager_core::request::{
    Dataset, FailurePolicy, Priority, RequestState, StagingRequest, TaskState, TransferMode,
};
use stager_core::{Error, Result};

use crate::scheduler::RunQueue;
use crate::shaping::ShapingGate;
use crate::tracker::RequestTracker;
use crate::transport::{Endpoint, Transport};

/// Flags a running task polls between I/O blocks.
pub struct TaskSignals {
    cancel: Arc<AtomicBool>,
    revoked: Arc<AtomicBool>,
}

impl TaskSignals {
    pub fn new(cancel: Arc<AtomicBool>, revoked: Arc<AtomicBool>) -> Self {
        Self { cancel, revoked }
    }

    /// Both flags unset, for tests driving the engine directly.
    pub fn none() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

/// How one task execution ended. `Requeued` carries the checkpoint offset
/// the task should resume from on another worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed,
    Requeued(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub chunk_size: u64,
    pub io_block_size: u64,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub default_bytes_per_sec: u64,
}

impl EngineOptions {
    pub fn from_config(config: &StagerConfig) -> Self {
        Self {
            chunk_size: config.staging.chunk_size,
            io_block_size: config.staging.io_block_size,
            max_attempts: config.retry.max_attempts,
            backoff: Duration::from_millis(config.retry.backoff_ms),
            default_bytes_per_sec: config.shaping.default_bytes_per_sec,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024 * 1024,
            io_block_size: 4 * 1024 * 1024,
            max_attempts: 3,
            backoff: Duration::from_millis(200),
            default_bytes_per_sec: 0,
        }
    }
}

pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    tracker: RequestTracker,
    queue: Arc<RunQueue>,
    shaping: ShapingGate,
    opts: EngineOptions,
}

enum RunResult {
    Done,
    Cancelled,
    Revoked(u64),
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        tracker: RequestTracker,
        queue: Arc<RunQueue>,
        shaping: ShapingGate,
        opts: EngineOptions,
    ) -> Self {
        Self {
            transport,
            tracker,
            queue,
            shaping,
            opts,
        }
    }

    pub fn shaping(&self) -> &ShapingGate {
        &self.shaping
    }

    /// Admit a staging request: validate fail-fast, plan chunk tasks,
    /// register with the tracker and enqueue. Nothing is enqueued if any
    /// dataset fails validation.
    pub fn submit(
        &self,
        sources: Vec<Dataset>,
        targets: Vec<Dataset>,
        mode: TransferMode,
        policy: FailurePolicy,
        priority: Priority,
    ) -> Result<StagingRequest> {
        if self.opts.chunk_size == 0 {
            return Err(Error::Validation(
                "staging.chunk_size must be non-zero".into(),
            ));
        }
        if sources.is_empty() {
            return Err(Error::Validation("request has no source datasets".into()));
        }
        if sources.len() != targets.len() {
            return Err(Error::Validation(format!(
                "{} sources but {} targets",
                sources.len(),
                targets.len()
            )));
        }
        for source in &sources {
            self.transport.probe(source, false)?;
        }
        for target in &targets {
            self.transport.probe(target, true)?;
        }
        let sizes = sources
            .iter()
            .map(|s| self.transport.size_of(s))
            .collect::<Result<Vec<u64>>>()?;

        let id = self.tracker.next_id();
        let request = StagingRequest {
            id,
            sources,
            targets,
            mode,
            policy,
            priority,
        };
        let tasks = plan_request(&request, &sizes, self.opts.chunk_size);
        self.tracker.register(request.clone(), &tasks);
        if self.opts.default_bytes_per_sec > 0 {
            self.shaping.set_limit(id, self.opts.default_bytes_per_sec);
        }

        tracing::info!(
            request_id = id,
            datasets = request.sources.len(),
            tasks = tasks.len(),
            bytes = sizes.iter().sum::<u64>(),
            mode = ?mode,
            "staging request admitted"
        );
        for task in tasks {
            self.queue.push(task, priority);
        }
        Ok(request)
    }

    /// Execute one task on the calling worker. Records the terminal task
    /// state in the tracker except for revocation, where the caller
    /// requeues the task instead.
    pub async fn execute(&self, task: TransferTask, signals: &TaskSignals) -> TaskOutcome {
        let id = task.request_id;
        let index = task.index;
        self.tracker.update_task(id, index, TaskState::Running, None);

        match self.run_task(&task, signals).await {
            Ok(RunResult::Done) => {
                let state = self.tracker.update_task(id, index, TaskState::Completed, None);
                self.on_request_settled(id, state);
                TaskOutcome::Completed
            }
            Ok(RunResult::Cancelled) => {
                let state = self.tracker.update_task(id, index, TaskState::Cancelled, None);
                self.on_request_settled(id, state);
                TaskOutcome::Cancelled
            }
            Ok(RunResult::Revoked(resume_offset)) => TaskOutcome::Requeued(resume_offset),
            Err(err) => {
                let state = self.tracker.update_task(
                    id,
                    index,
                    TaskState::Failed,
                    Some((err.kind(), err.to_string())),
                );
                self.on_request_settled(id, state);
                TaskOutcome::Failed
            }
        }
    }

    /// Record a task cancelled before dispatch. Goes through the same
    /// settle path as executed tasks so a request whose last outstanding
    /// task is dropped at the queue still releases its shaping bucket.
    pub fn discard_cancelled(&self, task: &TransferTask) {
        let state = self
            .tracker
            .update_task(task.request_id, task.index, TaskState::Cancelled, None);
        self.on_request_settled(task.request_id, state);
    }

    async fn run_task(&self, task: &TransferTask, signals: &TaskSignals) -> Result<RunResult> {
        let source = self.transport.open_source(&task.source)?;
        let target = self.transport.open_target(&task.target)?;

        // Zero-length dataset: materialize the (empty) target and be done.
        if task.len == 0 {
            target.flush()?;
            return Ok(RunResult::Done);
        }

        let block = self.opts.io_block_size.min(task.len).max(1) as usize;
        let mut buf = vec![0u8; block];
        let mut done = task.resume_offset;

        while done < task.len {
            if signals.cancelled() {
                return Ok(RunResult::Cancelled);
            }
            if signals.revoked() {
                return Ok(RunResult::Revoked(done));
            }

            let offset = task.offset + done;
            let want = ((task.len - done) as usize).min(block);
            self.copy_block(source.as_ref(), target.as_ref(), offset, &mut buf[..want])
                .await?;
            self.shaping.throttle(task.request_id, want as u64).await;

            done += want as u64;
            self.tracker.checkpoint(task.request_id, task.index, done);
        }
        target.flush()?;
        Ok(RunResult::Done)
    }

    /// Copy one block, retrying transient failures with linear backoff.
    /// Writes are offset-addressed and idempotent, so replaying a block
    /// after a partial failure is safe.
    async fn copy_block(
        &self,
        source: &dyn Endpoint,
        target: &dyn Endpoint,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_block(source, target, offset, buf) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.opts.max_attempts => {
                    tracing::warn!(
                        source = %source.describe(),
                        target = %target.describe(),
                        offset,
                        attempt,
                        error = %err,
                        "transient block failure, backing off"
                    );
                    tokio::time::sleep(self.opts.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_block(
        &self,
        source: &dyn Endpoint,
        target: &dyn Endpoint,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = source.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                // The source shrank under us; planned length no longer holds.
                return Err(Error::Io {
                    path: source.describe(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "source truncated during transfer",
                    ),
                });
            }
            filled += n;
        }
        target.write_at(offset, buf)
    }

    /// Runs after any task reaches a terminal state. Once the whole request
    /// settles: release its shaping bucket, and for a completed Move unlink
    /// the sources exactly once.
    fn on_request_settled(&self, id: u64, state: Option<RequestState>) {
        let Some(state) = state else { return };
        if !state.is_terminal() {
            return;
        }
        self.shaping.clear(id);

        if state == RequestState::Completed {
            if let Some(request) = self.tracker.take_finalize(id) {
                for source in &request.sources {
                    if let Err(err) = self.transport.remove(source) {
                        tracing::warn!(
                            request_id = id,
                            path = %source.path,
                            error = %err,
                            "move finalization could not unlink source"
                        );
                    }
                }
                tracing::info!(request_id = id, "move finalized, sources removed");
            }
        }
        self.transport.prune_idle();
        tracing::info!(request_id = id, state = ?state, "request settled");
    }
}
