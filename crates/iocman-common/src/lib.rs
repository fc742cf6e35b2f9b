//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Shared primitives and utilities for the fleet runtime."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Shared primitives for the IOC fleet manager workspace.
//! This crate exposes configuration loading, logging setup, and the
//! wall-clock helpers used to turn liveness timestamps into ages.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, BusConfig, ControlConfig, ControlEndpoint, FleetConfig, GeneralConfig,
    LivenessSource, LoadedFleetConfig, LoggingConfig, MetricsConfig, RetryConfig, WorkerConfig,
};
pub use logging::{init_tracing, LogFormat};
