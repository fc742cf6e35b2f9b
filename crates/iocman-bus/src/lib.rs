//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Control-point bus used by the fleet manager.
//!
//! Points are addressed by fully qualified name (`<prefix>:<suffix>`). The
//! manager publishes control, heartbeat and state points; operators and
//! workers write points through [`PointBus::write`], which is the only path
//! that notifies write subscribers.
#![warn(missing_docs)]

pub mod api;
pub mod http;
pub mod memory;
pub mod point;
pub mod probe;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use api::{spawn_api_server, ApiServer};
pub use http::HttpPointReader;
pub use memory::InMemoryPointBus;
pub use point::{qualified_name, AlarmSeverity, Point, PointValue, PointWrite};
pub use probe::{BusLivenessProbe, Liveness, LivenessProbe, ProbeFault};

/// Convenience result alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by bus backends.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The remote gateway could not be reached or answered garbage.
    #[error("point gateway request failed: {0}")]
    Gateway(#[from] reqwest::Error),
    /// The remote gateway answered with an unexpected status.
    #[error("point gateway returned status {status} for {name}")]
    Status {
        /// Point requested.
        name: String,
        /// HTTP status code.
        status: u16,
    },
    /// A point URL could not be built from the gateway base.
    #[error("invalid point url: {0}")]
    Url(#[from] url::ParseError),
}

/// Read side of the bus. Enough for liveness probing.
#[async_trait]
pub trait PointReader: Send + Sync {
    /// Read a point by qualified name. `Ok(None)` when it was never published.
    async fn read(&self, name: &str) -> Result<Option<Point>>;

    /// Human-readable backend name for logging.
    fn describe(&self) -> String;
}

/// Full bus used by the manager host.
#[async_trait]
pub trait PointBus: PointReader {
    /// Publish a value owned by the manager. Does not notify write subscribers.
    async fn publish(&self, name: &str, value: PointValue, severity: AlarmSeverity) -> Result<()>;

    /// Apply an external write (operator or worker) and notify subscribers.
    async fn write(&self, name: &str, value: PointValue) -> Result<Point>;

    /// Every point currently held, in first-published order.
    async fn list(&self) -> Result<Vec<(String, Point)>>;

    /// Subscribe to external writes.
    fn subscribe_writes(&self) -> broadcast::Receiver<PointWrite>;
}
