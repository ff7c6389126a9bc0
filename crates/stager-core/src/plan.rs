//! Chunk planner — splits a staging request into transfer tasks.
//!
//! Planning is deterministic: for a fixed (file sizes, chunk_size) input the
//! task boundaries are always identical, so a replanned request after a
//! restart produces the same work units.

use serde::{Deserialize, Serialize};

use crate::request::{Dataset, StagingRequest};

/// One chunk-level unit of work: a byte range of one (source, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub request_id: u64,
    /// Position within the request's task list.
    pub index: u32,
    pub source: Dataset,
    pub target: Dataset,
    /// Byte offset of this chunk in both source and target.
    pub offset: u64,
    /// Chunk length in bytes. Zero for an empty source file.
    pub len: u64,
    /// Bytes already transferred; non-zero when a task was requeued after a
    /// node removal and must resume from its checkpoint.
    #[serde(default)]
    pub resume_offset: u64,
}

impl TransferTask {
    pub fn remaining(&self) -> u64 {
        self.len - self.resume_offset
    }
}

/// Split every (source, target) pair into fixed-size chunks.
///
/// `source_sizes` must be parallel to `request.sources`. An empty file still
/// yields one zero-length task so the target gets materialized and Move
/// semantics still apply to the source.
pub fn plan_request(
    request: &StagingRequest,
    source_sizes: &[u64],
    chunk_size: u64,
) -> Vec<TransferTask> {
    assert_eq!(request.sources.len(), source_sizes.len());
    assert!(chunk_size > 0, "chunk_size must be non-zero");

    let mut tasks = Vec::new();
    let mut index = 0u32;

    for ((source, target), &size) in request
        .sources
        .iter()
        .zip(request.targets.iter())
        .zip(source_sizes.iter())
    {
        let mut offset = 0u64;
        loop {
            let len = chunk_size.min(size - offset);
            tasks.push(TransferTask {
                request_id: request.id,
                index,
                source: source.clone(),
                target: target.clone(),
                offset,
                len,
                resume_offset: 0,
            });
            index += 1;
            offset += len;
            if offset >= size {
                break;
            }
        }
    }

    tasks
}
