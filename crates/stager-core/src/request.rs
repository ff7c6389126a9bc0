//! Request data model — datasets, staging requests, and their states.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a dataset should be accessed. `Parallel` marks datasets that live on
/// a parallel filesystem and tolerate striped access; both kinds currently
/// run through the configured transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    #[default]
    Posix,
    Parallel,
}

/// A source or target location.
///
/// Local paths are plain filesystem paths. Remote targets use
/// `tcp://host:port/abs/path` and are only valid with the tcp backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(default)]
    pub kind: DatasetKind,
}

impl Dataset {
    pub fn posix(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: DatasetKind::Posix,
        }
    }

    /// The path component with any `scheme://host:port` prefix stripped.
    pub fn local_path(&self) -> PathBuf {
        match self.path.split_once("://") {
            Some((_, rest)) => match rest.split_once('/') {
                Some((_, p)) => PathBuf::from(format!("/{p}")),
                None => PathBuf::from(rest),
            },
            None => PathBuf::from(&self.path),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.path.contains("://")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Copy,
    /// Copy, then unlink the sources once the whole request completed.
    Move,
}

/// What to do when one chunk fails terminally (spec'd per request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    AbortOnFirstFailure,
    /// Skip the failed chunk, keep going, surface the error list at the end.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// A staging request as accepted by the coordinator. Immutable once
/// accepted; only its tracked status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRequest {
    pub id: u64,
    pub sources: Vec<Dataset>,
    pub targets: Vec<Dataset>,
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub priority: Priority,
}

/// Request lifecycle. `Running` and `Completed` may additionally carry a
/// degraded flag in the tracked status when some chunks failed under
/// best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Per-chunk task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}
