//! stager-services — tracker, scheduler, transfer engine, and transports.

pub mod engine;
pub mod receiver;
pub mod scheduler;
pub mod shaping;
pub mod tracker;
pub mod transport;

pub use engine::{EngineOptions, TaskOutcome, TaskSignals, TransferEngine};
pub use receiver::DataReceiver;
pub use scheduler::{MalleabilityEvent, RunQueue, Scheduler};
pub use shaping::ShapingGate;
pub use tracker::{CancelOutcome, RequestStatus, RequestTracker, TaskErrorInfo};
pub use transport::{make_transport, Endpoint, MockTransport, PosixTransport, TcpTransport, Transport};
