//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Per-worker reconciliation engine.
//!
//! Each worker owns one long-lived transition task fed by a single-slot
//! mailbox. A command submitted while a transition is running waits in the
//! slot; a newer command replaces the waiting one, whose ticket resolves to
//! [`TransitionOutcome::Superseded`]. Sweep observations and transitions both
//! publish through a per-worker lock, so points are never written out of
//! order for the same worker.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use iocman_bus::{qualified_name, AlarmSeverity, Liveness, PointBus, PointValue};
use iocman_common::FleetConfig;
use iocman_control::{ControlPlane, DaemonFault, ProcessState};
use iocman_metrics::FleetMetrics;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::errors::{EngineError, RegistryError, Result, TransitionFault};
use crate::registry::WorkerRegistry;
use crate::retry::RetryPolicy;
use crate::state::{
    Command, HeartbeatRecord, TransitionOutcome, WorkerControlState, WorkerSnapshot,
};

/// Tunables for the engine, usually derived from [`FleetConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Point name prefix (`<prefix>:<worker>_control`).
    pub prefix: String,
    pub stale_threshold: Duration,
    /// Pause between the stop and start phases of a reset.
    pub reset_settle: Duration,
    /// Heartbeat age published when no reading is available.
    pub heartbeat_sentinel: u32,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            prefix: config.general.prefix.clone(),
            stale_threshold: config.general.effective_stale_threshold(),
            reset_settle: config.general.reset_settle,
            heartbeat_sentinel: config.general.heartbeat_sentinel,
            retry: config.control.retry.into(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

/// What one sweep learned about one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerObservation {
    pub worker: String,
    pub sequence: u64,
    /// Daemon-reported state; `None` when the query failed or timed out.
    pub daemon: Option<ProcessState>,
    /// Liveness timestamp read this sweep.
    pub timestamp: Option<f64>,
    /// Age derived from `timestamp`.
    pub age: Option<f64>,
}

impl WorkerObservation {
    /// Observation for a worker whose check did not finish within the sweep budget.
    pub fn abandoned(worker: impl Into<String>, sequence: u64) -> Self {
        Self {
            worker: worker.into(),
            sequence,
            daemon: None,
            timestamp: None,
            age: None,
        }
    }
}

/// Handle to a submitted command.
#[derive(Debug)]
pub struct TransitionTicket {
    worker: String,
    command: Command,
    reply: oneshot::Receiver<TransitionOutcome>,
}

impl TransitionTicket {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Wait for the transition to finish or be superseded.
    pub async fn outcome(self) -> Result<TransitionOutcome> {
        self.reply.await.map_err(|_| EngineError::ShutDown)
    }
}

struct Pending {
    command: Command,
    reply: oneshot::Sender<TransitionOutcome>,
}

struct WorkerRecord {
    state: WorkerControlState,
    heartbeat: HeartbeatRecord,
    busy: bool,
    pending: Option<Pending>,
}

struct PointNames {
    control: String,
    heartbeat: String,
    state: String,
}

struct WorkerSlot {
    points: PointNames,
    record: Mutex<WorkerRecord>,
    wake: Notify,
    publish: tokio::sync::Mutex<()>,
}

struct EngineInner {
    settings: EngineSettings,
    control: Arc<dyn ControlPlane>,
    bus: Arc<dyn PointBus>,
    metrics: Option<FleetMetrics>,
    workers: IndexMap<String, WorkerSlot>,
    rng: Mutex<StdRng>,
}

/// Owner of every worker's control state and heartbeat record.
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

impl ReconciliationEngine {
    pub fn new(
        registry: &WorkerRegistry,
        settings: EngineSettings,
        control: Arc<dyn ControlPlane>,
        bus: Arc<dyn PointBus>,
        metrics: Option<FleetMetrics>,
    ) -> Self {
        let workers = registry
            .names()
            .map(|name| {
                let point = |suffix: &str| qualified_name(&settings.prefix, &format!("{name}_{suffix}"));
                let slot = WorkerSlot {
                    points: PointNames {
                        control: point("control"),
                        heartbeat: point("hb"),
                        state: point("state"),
                    },
                    record: Mutex::new(WorkerRecord {
                        state: WorkerControlState::Stopped,
                        heartbeat: HeartbeatRecord::unknown(name),
                        busy: false,
                        pending: None,
                    }),
                    wake: Notify::new(),
                    publish: tokio::sync::Mutex::new(()),
                };
                (name.to_owned(), slot)
            })
            .collect();
        Self {
            inner: Arc::new(EngineInner {
                settings,
                control,
                bus,
                metrics,
                workers,
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.inner.workers.keys().map(String::as_str)
    }

    /// Queue `command` for `worker`. Returns immediately.
    pub fn submit(&self, worker: &str, command: Command) -> Result<TransitionTicket> {
        let slot = self.slot(worker)?;
        let (reply, receiver) = oneshot::channel();
        let replaced = slot
            .record
            .lock()
            .pending
            .replace(Pending { command, reply });
        if let Some(old) = replaced {
            info!(
                worker,
                superseded = %old.command,
                by = %command,
                "queued command superseded"
            );
            let _ = old.reply.send(TransitionOutcome::Superseded);
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_transition(worker, old.command.as_str(), "superseded");
            }
        } else {
            debug!(worker, %command, "command queued");
        }
        slot.wake.notify_one();
        Ok(TransitionTicket {
            worker: worker.to_owned(),
            command,
            reply: receiver,
        })
    }

    pub fn state(&self, worker: &str) -> Result<WorkerControlState> {
        Ok(self.slot(worker)?.record.lock().state)
    }

    pub fn heartbeat(&self, worker: &str) -> Result<HeartbeatRecord> {
        Ok(self.slot(worker)?.record.lock().heartbeat.clone())
    }

    /// No transition running and none queued.
    pub fn is_idle(&self, worker: &str) -> Result<bool> {
        let record = self.slot(worker)?.record.lock();
        Ok(!record.busy && record.pending.is_none())
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.inner
            .workers
            .iter()
            .map(|(name, slot)| {
                let record = slot.record.lock();
                WorkerSnapshot {
                    worker: name.clone(),
                    state: record.state,
                    heartbeat: record.heartbeat.clone(),
                    busy: record.busy || record.pending.is_some(),
                }
            })
            .collect()
    }

    /// Publish the current points of every worker.
    pub async fn publish_all(&self) {
        for name in self.inner.workers.keys() {
            if let Err(err) = self.republish(name).await {
                warn!(worker = %name, error = %err, "failed to publish worker points");
            }
        }
    }

    /// Publish the current points of one worker, e.g. to undo an invalid write.
    pub async fn republish(&self, worker: &str) -> Result<()> {
        let slot = self.slot(worker)?;
        let _guard = slot.publish.lock().await;
        let (state, heartbeat) = {
            let record = slot.record.lock();
            (record.state, record.heartbeat.clone())
        };
        self.publish_state(worker, slot, state).await;
        self.publish_heartbeat(worker, slot, &heartbeat).await;
        Ok(())
    }

    /// Fold one sweep observation into the worker's records.
    ///
    /// Returns `false` when the observation is older than what is already
    /// recorded and was discarded. Control state is reconciled against the
    /// daemon only while the worker is idle.
    pub async fn record_observation(&self, observation: WorkerObservation) -> Result<bool> {
        let worker = observation.worker.as_str();
        let slot = self.slot(worker)?;
        let _guard = slot.publish.lock().await;
        let threshold = self.inner.settings.stale_threshold;
        let (heartbeat, transition) = {
            let mut record = slot.record.lock();
            if observation.sequence <= record.heartbeat.sequence {
                debug!(
                    worker,
                    sequence = observation.sequence,
                    recorded = record.heartbeat.sequence,
                    "discarding out-of-order observation"
                );
                return Ok(false);
            }
            let liveness = Liveness::classify(observation.age, threshold);
            let last_timestamp = observation.timestamp.or(record.heartbeat.last_timestamp);
            record.heartbeat = HeartbeatRecord {
                worker: worker.to_owned(),
                age: observation.age,
                liveness,
                sequence: observation.sequence,
                last_timestamp,
            };
            let idle = !record.busy && record.pending.is_none();
            let previous = record.state;
            let next = match observation.daemon {
                Some(daemon) if idle => previous.reconcile(daemon),
                _ => None,
            };
            if let Some(next) = next {
                record.state = next;
            }
            (record.heartbeat.clone(), next.map(|next| (previous, next)))
        };

        if heartbeat.liveness == Liveness::Stale {
            warn!(
                worker,
                age = heartbeat.age.unwrap_or_default(),
                "heartbeat stale while daemon reports running"
            );
        }
        self.publish_heartbeat(worker, slot, &heartbeat).await;
        if let Some((previous, next)) = transition {
            info!(
                worker,
                from = %previous,
                to = %next,
                daemon = ?observation.daemon,
                "control state reconciled with daemon"
            );
            self.publish_state(worker, slot, next).await;
        }
        Ok(true)
    }

    /// Spawn one transition task per worker. Tasks exit on `shutdown`.
    pub fn spawn_workers(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.inner
            .workers
            .keys()
            .map(|name| {
                let engine = self.clone();
                let name = name.clone();
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move { engine.run_worker(&name, &mut shutdown_rx).await })
            })
            .collect()
    }

    fn slot(&self, worker: &str) -> std::result::Result<&WorkerSlot, RegistryError> {
        self.inner
            .workers
            .get(worker)
            .ok_or_else(|| RegistryError::NotFound(worker.to_owned()))
    }

    async fn run_worker(&self, name: &str, shutdown: &mut broadcast::Receiver<()>) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        debug!(worker = name, "transition task started");
        loop {
            let next = {
                let mut record = slot.record.lock();
                let next = record.pending.take();
                record.busy = next.is_some();
                next
            };
            let pending = match next {
                Some(pending) => pending,
                None => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = slot.wake.notified() => {}
                    }
                    continue;
                }
            };
            let outcome = tokio::select! {
                _ = shutdown.recv() => break,
                outcome = self.execute(name, slot, pending.command) => outcome,
            };
            slot.record.lock().busy = false;
            self.report_outcome(name, pending.command, &outcome);
            let _ = pending.reply.send(outcome);
        }
        debug!(worker = name, "transition task stopped");
    }

    async fn execute(&self, name: &str, slot: &WorkerSlot, command: Command) -> TransitionOutcome {
        info!(worker = name, %command, "transition started");
        match command {
            Command::Run => {
                self.set_state(name, slot, WorkerControlState::Starting).await;
                self.finish_start(name, slot).await
            }
            Command::Stop => {
                self.set_state(name, slot, WorkerControlState::Stopping).await;
                match self.stop_phase(name).await {
                    Ok(()) => self.complete(name, slot, WorkerControlState::Stopped).await,
                    Err(fault) => {
                        self.set_state(name, slot, WorkerControlState::ErrorStopping)
                            .await;
                        TransitionOutcome::Failed(TransitionFault::StopFailed(fault))
                    }
                }
            }
            Command::Reset => {
                self.set_state(name, slot, WorkerControlState::Resetting).await;
                if let Err(fault) = self.stop_phase(name).await {
                    self.set_state(name, slot, WorkerControlState::ErrorStopping)
                        .await;
                    return TransitionOutcome::Failed(TransitionFault::ResetAborted(fault));
                }
                sleep(self.inner.settings.reset_settle).await;
                self.finish_start(name, slot).await
            }
        }
    }

    async fn finish_start(&self, name: &str, slot: &WorkerSlot) -> TransitionOutcome {
        match self.start_phase(name).await {
            Ok(()) => self.complete(name, slot, WorkerControlState::Running).await,
            Err(fault) => {
                self.set_state(name, slot, WorkerControlState::ErrorStarting)
                    .await;
                TransitionOutcome::Failed(TransitionFault::StartFailed(fault))
            }
        }
    }

    async fn complete(
        &self,
        name: &str,
        slot: &WorkerSlot,
        state: WorkerControlState,
    ) -> TransitionOutcome {
        self.set_state(name, slot, state).await;
        TransitionOutcome::Completed(state)
    }

    async fn start_phase(&self, name: &str) -> std::result::Result<(), DaemonFault> {
        let control = &self.inner.control;
        match self.call_with_retry(name, "start", || control.start(name)).await {
            Err(DaemonFault::AlreadyRunning) => {
                debug!(worker = name, "already running");
                Ok(())
            }
            other => other,
        }
    }

    async fn stop_phase(&self, name: &str) -> std::result::Result<(), DaemonFault> {
        let control = &self.inner.control;
        match self.call_with_retry(name, "stop", || control.stop(name)).await {
            Err(DaemonFault::NotRunning) => {
                debug!(worker = name, "already stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn call_with_retry<F, Fut>(
        &self,
        worker: &str,
        operation: &'static str,
        mut call: F,
    ) -> std::result::Result<(), DaemonFault>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = iocman_control::Result<()>>,
    {
        let policy = self.inner.settings.retry;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(fault) if fault.is_retryable() && attempt < policy.max_attempts => {
                    let delay = {
                        let mut rng = self.inner.rng.lock();
                        policy.backoff_delay(attempt, &mut *rng)
                    };
                    warn!(
                        worker,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %fault,
                        "daemon unreachable; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn set_state(&self, name: &str, slot: &WorkerSlot, state: WorkerControlState) {
        let _guard = slot.publish.lock().await;
        slot.record.lock().state = state;
        self.publish_state(name, slot, state).await;
    }

    async fn publish_state(&self, name: &str, slot: &WorkerSlot, state: WorkerControlState) {
        let severity = state.severity();
        self.publish_point(
            &slot.points.control,
            PointValue::Int(state.control_index()),
            severity,
        )
        .await;
        self.publish_point(
            &slot.points.state,
            PointValue::Text(state.as_str().to_owned()),
            severity,
        )
        .await;
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_control_state(name, state.control_index());
        }
    }

    async fn publish_heartbeat(&self, name: &str, slot: &WorkerSlot, heartbeat: &HeartbeatRecord) {
        let age = heartbeat.published_age(self.inner.settings.heartbeat_sentinel);
        let severity = match heartbeat.liveness {
            Liveness::Stale => AlarmSeverity::Minor,
            Liveness::Fresh | Liveness::Unknown => AlarmSeverity::NoAlarm,
        };
        self.publish_point(&slot.points.heartbeat, PointValue::Int(i64::from(age)), severity)
            .await;
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_heartbeat_age(name, age);
        }
    }

    async fn publish_point(&self, point: &str, value: PointValue, severity: AlarmSeverity) {
        if let Err(err) = self.inner.bus.publish(point, value, severity).await {
            warn!(point, error = %err, "failed to publish point");
        }
    }

    fn report_outcome(&self, name: &str, command: Command, outcome: &TransitionOutcome) {
        match outcome {
            TransitionOutcome::Completed(state) => {
                info!(worker = name, %command, %state, "transition completed");
            }
            TransitionOutcome::Failed(fault) => {
                error!(worker = name, %command, error = %fault, "transition failed");
            }
            TransitionOutcome::Superseded => {}
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_transition(name, command.as_str(), outcome.label());
        }
    }
}
