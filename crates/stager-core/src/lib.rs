//! stager-core — shared types for the stager data-staging daemon.

pub mod config;
pub mod error;
pub mod plan;
pub mod request;
pub mod wire;

pub use error::{Error, ErrorKind, Result};
pub use request::{
    Dataset, DatasetKind, FailurePolicy, Priority, RequestState, StagingRequest, TaskState,
    TransferMode,
};
