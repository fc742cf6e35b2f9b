//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::fmt;

use iocman_bus::{AlarmSeverity, Liveness};
use iocman_common::time::whole_seconds;
use iocman_control::ProcessState;
use serde::Serialize;

use crate::errors::TransitionFault;

/// Operator command. The discriminant is the wire index on control points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Command {
    Stop = 0,
    Run = 1,
    Reset = 2,
}

impl Command {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Command::Stop),
            1 => Some(Command::Run),
            2 => Some(Command::Reset),
            _ => None,
        }
    }

    pub fn index(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Run => "run",
            Command::Reset => "reset",
        }
    }

    /// Severity shown on a control point holding this command.
    pub fn severity(self) -> AlarmSeverity {
        match self {
            Command::Run => AlarmSeverity::NoAlarm,
            Command::Stop | Command::Reset => AlarmSeverity::Minor,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a command applies to. `All` expands to the autostart workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Worker(String),
    All,
}

/// Published control state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkerControlState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Resetting,
    ErrorStarting,
    ErrorStopping,
}

impl WorkerControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerControlState::Stopped => "Stopped",
            WorkerControlState::Starting => "Starting",
            WorkerControlState::Running => "Running",
            WorkerControlState::Stopping => "Stopping",
            WorkerControlState::Resetting => "Resetting",
            WorkerControlState::ErrorStarting => "ErrorStarting",
            WorkerControlState::ErrorStopping => "ErrorStopping",
        }
    }

    /// Command index mirrored on the `_control` point.
    ///
    /// A failed start leaves the point at Stop and a failed stop at Run, so
    /// the operator sees what actually happened; severity carries the error.
    pub fn control_index(self) -> i64 {
        match self {
            WorkerControlState::Stopped
            | WorkerControlState::Stopping
            | WorkerControlState::ErrorStarting => Command::Stop.index(),
            WorkerControlState::Running
            | WorkerControlState::Starting
            | WorkerControlState::ErrorStopping => Command::Run.index(),
            WorkerControlState::Resetting => Command::Reset.index(),
        }
    }

    pub fn severity(self) -> AlarmSeverity {
        if self.is_error() {
            return AlarmSeverity::Major;
        }
        Command::from_index(self.control_index())
            .map(Command::severity)
            .unwrap_or_default()
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            WorkerControlState::ErrorStarting | WorkerControlState::ErrorStopping
        )
    }

    /// State implied by the daemon for an idle worker, if it differs.
    ///
    /// Unknown daemon state never changes anything; an in-progress daemon
    /// state (starting, stopping) is left for the next sweep.
    pub fn reconcile(self, daemon: ProcessState) -> Option<Self> {
        match (self, daemon) {
            (
                WorkerControlState::Stopped | WorkerControlState::ErrorStarting,
                ProcessState::Running,
            ) => Some(WorkerControlState::Running),
            (
                WorkerControlState::Running | WorkerControlState::ErrorStopping,
                ProcessState::Stopped | ProcessState::Fatal,
            ) => Some(WorkerControlState::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest heartbeat knowledge for one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub worker: String,
    /// Seconds since the worker last refreshed its liveness point.
    pub age: Option<f64>,
    pub liveness: Liveness,
    /// Sweep that produced this record; zero before the first sweep.
    pub sequence: u64,
    pub last_timestamp: Option<f64>,
}

impl HeartbeatRecord {
    pub fn unknown(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            age: None,
            liveness: Liveness::Unknown,
            sequence: 0,
            last_timestamp: None,
        }
    }

    /// Integer age as published on the `_hb` point.
    pub fn published_age(&self, sentinel: u32) -> u32 {
        match (self.liveness, self.age) {
            (Liveness::Unknown, _) | (_, None) => sentinel,
            (_, Some(age)) => whole_seconds(age, sentinel),
        }
    }
}

/// Result delivered through a transition ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Completed(WorkerControlState),
    Failed(TransitionFault),
    /// A newer command replaced this one before it started.
    Superseded,
}

impl TransitionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Completed(_) => "completed",
            TransitionOutcome::Failed(_) => "failed",
            TransitionOutcome::Superseded => "superseded",
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub worker: String,
    pub state: WorkerControlState,
    pub heartbeat: HeartbeatRecord,
    pub busy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_points_mirror_states() {
        assert_eq!(WorkerControlState::Stopped.control_index(), 0);
        assert_eq!(
            WorkerControlState::Stopped.severity(),
            AlarmSeverity::Minor
        );
        assert_eq!(WorkerControlState::Running.control_index(), 1);
        assert_eq!(
            WorkerControlState::Running.severity(),
            AlarmSeverity::NoAlarm
        );
        assert_eq!(WorkerControlState::Resetting.control_index(), 2);
        assert_eq!(
            WorkerControlState::ErrorStarting.severity(),
            AlarmSeverity::Major
        );
        assert_eq!(WorkerControlState::ErrorStopping.control_index(), 1);
    }

    #[test]
    fn reconcile_follows_confirmed_daemon_state() {
        use WorkerControlState::*;
        assert_eq!(Stopped.reconcile(ProcessState::Running), Some(Running));
        assert_eq!(ErrorStarting.reconcile(ProcessState::Running), Some(Running));
        assert_eq!(Running.reconcile(ProcessState::Fatal), Some(Stopped));
        assert_eq!(ErrorStopping.reconcile(ProcessState::Stopped), Some(Stopped));
        assert_eq!(Running.reconcile(ProcessState::Unknown), None);
        assert_eq!(Running.reconcile(ProcessState::Starting), None);
        assert_eq!(ErrorStarting.reconcile(ProcessState::Stopped), None);
    }

    #[test]
    fn unknown_heartbeat_publishes_sentinel() {
        let mut record = HeartbeatRecord::unknown("magnet1");
        assert_eq!(record.published_age(999), 999);
        record.age = Some(4.7);
        record.liveness = Liveness::Fresh;
        assert_eq!(record.published_age(999), 4);
        record.age = Some(4000.0);
        record.liveness = Liveness::Stale;
        assert_eq!(record.published_age(999), 999);
    }

    #[test]
    fn commands_round_trip_wire_index() {
        for command in [Command::Stop, Command::Run, Command::Reset] {
            assert_eq!(Command::from_index(command.index()), Some(command));
        }
        assert_eq!(Command::from_index(3), None);
    }
}
