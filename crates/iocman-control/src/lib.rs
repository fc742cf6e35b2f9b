//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Control-plane client for the external process daemon.
//!
//! The daemon (supervisord) owns the OS processes; this crate only issues
//! request/response RPCs to it and folds every daemon-specific failure into
//! a [`DaemonFault`].
#![warn(missing_docs)]

pub mod client;
pub mod fault;
pub mod process;
pub mod transport;
pub mod xmlrpc;

/// Shared result type for control-plane operations.
pub type Result<T> = std::result::Result<T, DaemonFault>;

pub use client::{ControlPlane, SupervisorClient};
pub use fault::DaemonFault;
pub use process::{ConfigChanges, ProcessInfo, ProcessState};
pub use transport::{HttpTransport, RpcTransport, TransportError, UnixSocketTransport};
pub use xmlrpc::{CodecError, RpcFailure, Value};
