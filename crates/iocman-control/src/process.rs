//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::fmt;

use crate::xmlrpc::{CodecError, Value};

/// Process state as reported by the daemon, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Process is up and past its start grace period.
    Running,
    /// Process is not running (never started, stopped, or exited).
    Stopped,
    /// Process is being spawned or is backing off between spawn attempts.
    Starting,
    /// Process has been asked to stop and has not exited yet.
    Stopping,
    /// The daemon gave up spawning the process.
    Fatal,
    /// State the daemon could not or did not report.
    Unknown,
}

impl ProcessState {
    /// Map a supervisord numeric state code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 | 100 => ProcessState::Stopped,
            10 | 30 => ProcessState::Starting,
            20 => ProcessState::Running,
            40 => ProcessState::Stopping,
            200 => ProcessState::Fatal,
            _ => ProcessState::Unknown,
        }
    }

    /// Map a supervisord state name, used when only `statename` is present.
    pub fn from_name(name: &str) -> Self {
        match name {
            "STOPPED" | "EXITED" => ProcessState::Stopped,
            "STARTING" | "BACKOFF" => ProcessState::Starting,
            "RUNNING" => ProcessState::Running,
            "STOPPING" => ProcessState::Stopping,
            "FATAL" => ProcessState::Fatal,
            _ => ProcessState::Unknown,
        }
    }

    /// Whether the OS process is (as far as the daemon knows) gone.
    pub fn is_down(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Fatal)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Running => "RUNNING",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Subset of `getProcessInfo` the manager relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    /// Program name.
    pub name: String,
    /// Process group name; equal to `name` for single-process programs.
    pub group: String,
    /// Normalized state.
    pub state: ProcessState,
    /// Raw state name as reported by the daemon.
    pub statename: String,
    /// Free-form description (`pid 123, uptime 0:01:02`).
    pub description: String,
    /// OS pid, zero when not running.
    pub pid: i64,
}

impl ProcessInfo {
    /// Decode one process-info struct.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let name = value.member_str("name")?.to_owned();
        let group = value
            .get("group")
            .and_then(Value::as_str)
            .unwrap_or(&name)
            .to_owned();
        let statename = value
            .get("statename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let state = match value.get("state").and_then(Value::as_i64) {
            Some(code) => ProcessState::from_code(code),
            None => ProcessState::from_name(&statename),
        };
        Ok(Self {
            name,
            group,
            state,
            statename,
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            pid: value.get("pid").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Result of asking the daemon to re-read its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    /// Groups present in the new configuration but not yet loaded.
    pub added: Vec<String>,
    /// Groups whose configuration changed.
    pub changed: Vec<String>,
    /// Groups no longer present in the configuration.
    pub removed: Vec<String>,
}

impl ConfigChanges {
    /// Decode the `[[added, changed, removed]]` shape returned by `reloadConfig`.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let outer = value
            .as_array()
            .ok_or(CodecError::UnexpectedShape("reloadConfig result"))?;
        let inner = match outer.first() {
            Some(Value::Array(inner)) => inner,
            _ => return Err(CodecError::UnexpectedShape("reloadConfig result")),
        };
        let names = |index: usize| -> Result<Vec<String>, CodecError> {
            inner
                .get(index)
                .and_then(Value::as_array)
                .ok_or(CodecError::UnexpectedShape("reloadConfig group list"))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or(CodecError::UnexpectedShape("reloadConfig group name"))
                })
                .collect()
        };
        Ok(Self {
            added: names(0)?,
            changed: names(1)?,
            removed: names(2)?,
        })
    }
}
