//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use iocman_control::DaemonFault;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("worker {0} not found")]
    NotFound(String),
    #[error("worker {0} declared more than once")]
    Duplicate(String),
    #[error("invalid worker name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Why a transition did not reach its target state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionFault {
    #[error("start failed: {0}")]
    StartFailed(DaemonFault),
    #[error("stop failed: {0}")]
    StopFailed(DaemonFault),
    /// The stop phase of a reset hard-failed, so start was never attempted.
    #[error("reset aborted during stop: {0}")]
    ResetAborted(DaemonFault),
}

impl TransitionFault {
    pub fn daemon_fault(&self) -> &DaemonFault {
        match self {
            TransitionFault::StartFailed(fault)
            | TransitionFault::StopFailed(fault)
            | TransitionFault::ResetAborted(fault) => fault,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("engine shut down before the transition completed")]
    ShutDown,
}
