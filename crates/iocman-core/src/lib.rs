//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Fleet supervisor core: worker registry, per-worker reconciliation engine,
//! heartbeat sweep, bulk control, daemon program sync and the fleet host that
//! wires them together.

pub mod bulk;
pub mod engine;
pub mod errors;
pub mod fleet;
pub mod programs;
pub mod registry;
pub mod retry;
pub mod state;
pub mod sweep;

pub use bulk::BulkControl;
pub use engine::{EngineSettings, ReconciliationEngine, TransitionTicket, WorkerObservation};
pub use errors::{EngineError, RegistryError, Result, TransitionFault};
pub use fleet::{FleetDeps, FleetHandle, FleetHost};
pub use registry::{WorkerRegistry, WorkerSpec};
pub use retry::RetryPolicy;
pub use state::{
    Command, HeartbeatRecord, Target, TransitionOutcome, WorkerControlState, WorkerSnapshot,
};
pub use sweep::{HeartbeatSweep, SweepSettings, SweepSummary};
