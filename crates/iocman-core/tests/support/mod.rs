//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Fakes shared by the core integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iocman_bus::{
    AlarmSeverity, BusLivenessProbe, InMemoryPointBus, LivenessProbe, PointBus, PointValue,
    ProbeFault,
};
use iocman_common::time::unix_now;
use iocman_control::{ConfigChanges, ControlPlane, DaemonFault, ProcessInfo, ProcessState};
use iocman_core::{EngineSettings, ReconciliationEngine, RetryPolicy, WorkerRegistry, WorkerSpec};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const PREFIX: &str = "IOC:MAN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    Stop,
    Query,
    Reload,
    AddGroup,
}

#[derive(Default)]
struct FakeState {
    processes: HashMap<String, ProcessState>,
    faults: HashMap<(Op, String), VecDeque<DaemonFault>>,
    delays: HashMap<(Op, String), Duration>,
    calls: Vec<(Op, String)>,
    changes: ConfigChanges,
}

/// In-memory stand-in for the process daemon.
#[derive(Default)]
pub struct FakeControl {
    state: Mutex<FakeState>,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_process(&self, name: &str, state: ProcessState) {
        self.state.lock().processes.insert(name.to_owned(), state);
    }

    pub fn process(&self, name: &str) -> Option<ProcessState> {
        self.state.lock().processes.get(name).copied()
    }

    /// Fail the next `op` on `name` with `fault`. Faults queue up.
    pub fn fail_next(&self, op: Op, name: &str, fault: DaemonFault) {
        self.state
            .lock()
            .faults
            .entry((op, name.to_owned()))
            .or_default()
            .push_back(fault);
    }

    pub fn delay(&self, op: Op, name: &str, duration: Duration) {
        self.state
            .lock()
            .delays
            .insert((op, name.to_owned()), duration);
    }

    pub fn set_changes(&self, changes: ConfigChanges) {
        self.state.lock().changes = changes;
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.state.lock().calls.clone()
    }

    /// Start/stop calls for one worker, in order.
    pub fn transitions_for(&self, name: &str) -> Vec<Op> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(op, worker)| worker == name && matches!(op, Op::Start | Op::Stop))
            .map(|(op, _)| *op)
            .collect()
    }

    async fn begin(&self, op: Op, name: &str) -> Option<DaemonFault> {
        let (delay, fault) = {
            let mut state = self.state.lock();
            state.calls.push((op, name.to_owned()));
            let key = (op, name.to_owned());
            let delay = state.delays.get(&key).copied();
            let fault = state.faults.get_mut(&key).and_then(VecDeque::pop_front);
            (delay, fault)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        fault
    }

    fn info(name: &str, state: ProcessState) -> ProcessInfo {
        ProcessInfo {
            name: name.to_owned(),
            group: name.to_owned(),
            state,
            statename: state.to_string(),
            description: String::new(),
            pid: if state == ProcessState::Running { 4242 } else { 0 },
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn start(&self, name: &str) -> iocman_control::Result<()> {
        if let Some(fault) = self.begin(Op::Start, name).await {
            return Err(fault);
        }
        let mut state = self.state.lock();
        let process = state
            .processes
            .entry(name.to_owned())
            .or_insert(ProcessState::Stopped);
        if *process == ProcessState::Running {
            return Err(DaemonFault::AlreadyRunning);
        }
        *process = ProcessState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str) -> iocman_control::Result<()> {
        if let Some(fault) = self.begin(Op::Stop, name).await {
            return Err(fault);
        }
        let mut state = self.state.lock();
        let process = state
            .processes
            .entry(name.to_owned())
            .or_insert(ProcessState::Stopped);
        if process.is_down() {
            return Err(DaemonFault::NotRunning);
        }
        *process = ProcessState::Stopped;
        Ok(())
    }

    async fn query_state(&self, name: &str) -> iocman_control::Result<ProcessInfo> {
        if let Some(fault) = self.begin(Op::Query, name).await {
            return Err(fault);
        }
        match self.state.lock().processes.get(name) {
            Some(state) => Ok(Self::info(name, *state)),
            None => Err(DaemonFault::Unknown {
                code: 10,
                message: format!("BAD_NAME: {name}"),
            }),
        }
    }

    async fn query_all(&self) -> iocman_control::Result<Vec<ProcessInfo>> {
        Ok(self
            .state
            .lock()
            .processes
            .iter()
            .map(|(name, state)| Self::info(name, *state))
            .collect())
    }

    async fn reload_config(&self) -> iocman_control::Result<ConfigChanges> {
        if let Some(fault) = self.begin(Op::Reload, "").await {
            return Err(fault);
        }
        Ok(self.state.lock().changes.clone())
    }

    async fn add_process_group(&self, name: &str) -> iocman_control::Result<()> {
        match self.begin(Op::AddGroup, name).await {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// Liveness probe over the point table that can stall chosen workers.
pub struct ScriptedProbe {
    inner: BusLivenessProbe,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new(bus: &InMemoryPointBus) -> Arc<Self> {
        Arc::new(Self {
            inner: BusLivenessProbe::new(Arc::new(bus.clone()), PREFIX),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn stall(&self, worker: &str, duration: Duration) {
        self.delays.lock().insert(worker.to_owned(), duration);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, worker: &str, timeout: Duration) -> Result<f64, ProbeFault> {
        self.calls.lock().push(worker.to_owned());
        let stall = self.delays.lock().get(worker).copied();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        self.inner.probe(worker, timeout).await
    }
}

/// Write a liveness timestamp `age` seconds in the past.
pub async fn beat(bus: &InMemoryPointBus, worker: &str, age: f64) {
    bus.publish(
        &format!("{PREFIX}:{worker}_time"),
        PointValue::Float(unix_now() - age),
        AlarmSeverity::NoAlarm,
    )
    .await
    .expect("in-memory publish");
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        prefix: PREFIX.to_owned(),
        stale_threshold: Duration::from_secs(20),
        reset_settle: Duration::from_secs(1),
        heartbeat_sentinel: 999,
        retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::ZERO),
    }
}

pub fn registry(workers: &[(&str, bool)]) -> Arc<WorkerRegistry> {
    let specs = workers.iter().map(|(name, autostart)| {
        WorkerSpec::new(*name, Path::new("logs")).with_autostart(*autostart)
    });
    Arc::new(WorkerRegistry::from_specs(specs).expect("valid registry"))
}

/// Engine with running transition tasks over fakes.
pub struct Harness {
    pub control: Arc<FakeControl>,
    pub bus: InMemoryPointBus,
    pub probe: Arc<ScriptedProbe>,
    pub registry: Arc<WorkerRegistry>,
    pub engine: ReconciliationEngine,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new(workers: &[(&str, bool)]) -> Self {
        Self::with_settings(workers, settings())
    }

    pub fn with_settings(workers: &[(&str, bool)], settings: EngineSettings) -> Self {
        let control = FakeControl::new();
        let bus = InMemoryPointBus::new();
        let probe = ScriptedProbe::new(&bus);
        let registry = registry(workers);
        let engine = ReconciliationEngine::new(
            &registry,
            settings,
            control.clone(),
            Arc::new(bus.clone()),
            None,
        );
        let (shutdown, _) = broadcast::channel(4);
        let tasks = engine.spawn_workers(&shutdown);
        Self {
            control,
            bus,
            probe,
            registry,
            engine,
            shutdown,
            tasks,
        }
    }

    pub fn point(&self, suffix: &str) -> Option<iocman_bus::Point> {
        self.bus.get(&format!("{PREFIX}:{suffix}"))
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.await.expect("transition task joins");
        }
    }
}

/// Poll `condition` until it holds, failing the test after a while.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
