//! HTTP API handlers — exposes daemon state as JSON.

pub mod nodes;
pub mod requests;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use stager_services::{RequestTracker, Scheduler, ShapingGate, TransferEngine};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<TransferEngine>,
    pub tracker: RequestTracker,
    pub scheduler: Arc<Scheduler>,
    pub shaping: ShapingGate,
    /// Transport backend name from the config, e.g. "posix" or "tcp".
    pub transport_name: &'static str,
    pub started_at: Instant,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// Re-export handler functions for use in router setup.
pub use nodes::{handle_nodes, handle_nodes_add, handle_nodes_remove};
pub use requests::{
    handle_cancel, handle_request, handle_requests, handle_shaping, handle_submit,
};
pub use status::{handle_ping, handle_shutdown, handle_status};
