//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use crate::xmlrpc::RpcFailure;

/// supervisord `Faults.ALREADY_STARTED`.
pub const FAULT_ALREADY_STARTED: i64 = 60;
/// supervisord `Faults.NOT_RUNNING`.
pub const FAULT_NOT_RUNNING: i64 = 70;
/// supervisord `Faults.ALREADY_ADDED`.
pub const FAULT_ALREADY_ADDED: i64 = 90;

/// Uniform failure reported by every control-plane operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DaemonFault {
    /// The process was already running when a start was requested.
    #[error("process already running")]
    AlreadyRunning,
    /// The process was not running when a stop was requested.
    #[error("process not running")]
    NotRunning,
    /// The daemon could not be reached or did not answer in time.
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    /// Any other fault reported by the daemon, or a response we could not decode.
    #[error("daemon fault {code}: {message}")]
    Unknown {
        /// Raw fault code; `-1` for undecodable responses.
        code: i64,
        /// Fault string as reported.
        message: String,
    },
}

impl DaemonFault {
    /// Faults that mean the requested end state already holds.
    pub fn is_benign(&self) -> bool {
        matches!(self, DaemonFault::AlreadyRunning | DaemonFault::NotRunning)
    }

    /// Faults worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaemonFault::Unreachable(_))
    }

    /// Classify a raw XML-RPC fault. The code is authoritative; the fault
    /// string prefix is consulted for daemons that report a generic code.
    pub fn from_fault(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            FAULT_ALREADY_STARTED => DaemonFault::AlreadyRunning,
            FAULT_NOT_RUNNING => DaemonFault::NotRunning,
            _ if message.starts_with("ALREADY_STARTED") => DaemonFault::AlreadyRunning,
            _ if message.starts_with("NOT_RUNNING") => DaemonFault::NotRunning,
            _ => DaemonFault::Unknown { code, message },
        }
    }
}

impl From<RpcFailure> for DaemonFault {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Fault { code, message } => DaemonFault::from_fault(code, message),
            RpcFailure::Malformed(err) => DaemonFault::Unknown {
                code: -1,
                message: err.to_string(),
            },
        }
    }
}
