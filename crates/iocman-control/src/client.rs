//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iocman_common::config::ControlEndpoint;
use tracing::{debug, warn};

use crate::fault::FAULT_ALREADY_ADDED;
use crate::process::{ConfigChanges, ProcessInfo};
use crate::transport::{HttpTransport, RpcTransport, TransportError, UnixSocketTransport};
use crate::xmlrpc::{decode_response, encode_call, CodecError, Value};
use crate::{DaemonFault, Result};

/// Operations the manager needs from the process daemon.
///
/// Implementations must be safe to call concurrently: the heartbeat sweep and
/// operator transitions share one instance.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start a process and wait for the daemon to report it running.
    async fn start(&self, name: &str) -> Result<()>;
    /// Stop a process and wait for it to exit.
    async fn stop(&self, name: &str) -> Result<()>;
    /// Query one process.
    async fn query_state(&self, name: &str) -> Result<ProcessInfo>;
    /// Query every process the daemon knows about.
    async fn query_all(&self) -> Result<Vec<ProcessInfo>>;
    /// Ask the daemon to re-read its configuration.
    async fn reload_config(&self) -> Result<ConfigChanges>;
    /// Activate a process group added by a configuration reload.
    async fn add_process_group(&self, name: &str) -> Result<()>;
}

/// XML-RPC client for supervisord.
#[derive(Clone)]
pub struct SupervisorClient {
    transport: Arc<dyn RpcTransport>,
    timeout: Duration,
}

impl SupervisorClient {
    /// Wrap an existing transport. Every call is bounded by `timeout`.
    pub fn new(transport: Arc<dyn RpcTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Build a client for a configured endpoint.
    pub fn from_endpoint(
        endpoint: &ControlEndpoint,
        timeout: Duration,
    ) -> std::result::Result<Self, TransportError> {
        let transport: Arc<dyn RpcTransport> = match endpoint {
            ControlEndpoint::Unix { path } => Arc::new(UnixSocketTransport::new(path.clone())),
            ControlEndpoint::Http { url } => Arc::new(HttpTransport::new(url.clone())?),
        };
        Ok(Self::new(transport, timeout))
    }

    /// Target description for logs.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = encode_call(method, &params);
        debug!(method, endpoint = %self.transport.describe(), "control-plane call");
        let response = match tokio::time::timeout(self.timeout, self.transport.post(body)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(method, error = %err, "control-plane transport failed");
                return Err(DaemonFault::Unreachable(err.to_string()));
            }
            Err(_) => {
                self.transport.reset().await;
                warn!(method, timeout_ms = self.timeout.as_millis() as u64, "control-plane call timed out");
                return Err(DaemonFault::Unreachable(format!(
                    "{method} timed out after {:?}",
                    self.timeout
                )));
            }
        };
        decode_response(&response).map_err(DaemonFault::from)
    }

    async fn call_acknowledged(&self, method: &'static str, params: Vec<Value>) -> Result<()> {
        match self.call(method, params).await? {
            Value::Bool(true) => Ok(()),
            Value::Bool(false) => Err(DaemonFault::Unknown {
                code: 0,
                message: format!("{method} returned false"),
            }),
            _ => Err(malformed(CodecError::UnexpectedShape(method))),
        }
    }
}

fn malformed(err: CodecError) -> DaemonFault {
    DaemonFault::Unknown {
        code: -1,
        message: err.to_string(),
    }
}

#[async_trait]
impl ControlPlane for SupervisorClient {
    async fn start(&self, name: &str) -> Result<()> {
        self.call_acknowledged(
            "supervisor.startProcess",
            vec![Value::String(name.to_owned()), Value::Bool(true)],
        )
        .await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.call_acknowledged(
            "supervisor.stopProcess",
            vec![Value::String(name.to_owned()), Value::Bool(true)],
        )
        .await
    }

    async fn query_state(&self, name: &str) -> Result<ProcessInfo> {
        let value = self
            .call(
                "supervisor.getProcessInfo",
                vec![Value::String(name.to_owned())],
            )
            .await?;
        ProcessInfo::from_value(&value).map_err(malformed)
    }

    async fn query_all(&self) -> Result<Vec<ProcessInfo>> {
        let value = self.call("supervisor.getAllProcessInfo", Vec::new()).await?;
        value
            .as_array()
            .ok_or_else(|| malformed(CodecError::UnexpectedShape("getAllProcessInfo")))?
            .iter()
            .map(|item| ProcessInfo::from_value(item).map_err(malformed))
            .collect()
    }

    async fn reload_config(&self) -> Result<ConfigChanges> {
        let value = self.call("supervisor.reloadConfig", Vec::new()).await?;
        ConfigChanges::from_value(&value).map_err(malformed)
    }

    async fn add_process_group(&self, name: &str) -> Result<()> {
        match self
            .call_acknowledged(
                "supervisor.addProcessGroup",
                vec![Value::String(name.to_owned())],
            )
            .await
        {
            Err(DaemonFault::Unknown {
                code: FAULT_ALREADY_ADDED,
                ..
            }) => Ok(()),
            other => other,
        }
    }
}
