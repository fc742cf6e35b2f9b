//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Fixed-period heartbeat sweep.
//!
//! Every tick all workers are checked concurrently on one task: daemon state
//! first, then (for running workers only) the liveness point. Checks still
//! outstanding when the sweep budget runs out are dropped and recorded as
//! unknown for that sweep.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use iocman_bus::LivenessProbe;
use iocman_common::time::{age_seconds, unix_now};
use iocman_common::FleetConfig;
use iocman_control::{ControlPlane, ProcessState};
use iocman_metrics::FleetMetrics;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{ReconciliationEngine, WorkerObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub period: Duration,
    /// Bound on each daemon query and each liveness read.
    pub probe_timeout: Duration,
    /// Wall time after which outstanding checks are abandoned.
    pub budget: Duration,
}

impl SweepSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            period: config.general.sweep_period,
            probe_timeout: config.general.probe_timeout,
            budget: config.general.sweep_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub sequence: u64,
    pub elapsed: Duration,
    pub completed: usize,
    pub abandoned: Vec<String>,
}

pub struct HeartbeatSweep {
    engine: ReconciliationEngine,
    control: Arc<dyn ControlPlane>,
    probe: Arc<dyn LivenessProbe>,
    settings: SweepSettings,
    metrics: Option<FleetMetrics>,
    sequence: AtomicU64,
}

impl HeartbeatSweep {
    pub fn new(
        engine: ReconciliationEngine,
        control: Arc<dyn ControlPlane>,
        probe: Arc<dyn LivenessProbe>,
        settings: SweepSettings,
        metrics: Option<FleetMetrics>,
    ) -> Self {
        Self {
            engine,
            control,
            probe,
            settings,
            metrics,
            sequence: AtomicU64::new(0),
        }
    }

    /// Run one sweep over every worker and fold the results into the engine.
    pub async fn sweep_once(&self) -> SweepSummary {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let names: Vec<String> = self.engine.workers().map(str::to_owned).collect();
        let mut outstanding: HashSet<String> = names.iter().cloned().collect();

        let deadline = sleep(self.settings.budget);
        tokio::pin!(deadline);
        let mut checks: FuturesUnordered<_> = names
            .iter()
            .map(|name| self.check(name.clone(), sequence))
            .collect();

        let mut completed = 0;
        while !checks.is_empty() {
            tokio::select! {
                Some(observation) = checks.next() => {
                    outstanding.remove(&observation.worker);
                    completed += 1;
                    self.record(observation).await;
                }
                _ = &mut deadline => break,
            }
        }
        drop(checks);

        let abandoned: Vec<String> = names
            .into_iter()
            .filter(|name| outstanding.contains(name))
            .collect();
        for worker in &abandoned {
            warn!(worker = %worker, sequence, "liveness check abandoned at sweep budget");
            self.record(WorkerObservation::abandoned(worker.clone(), sequence))
                .await;
        }

        let summary = SweepSummary {
            sequence,
            elapsed: started.elapsed(),
            completed,
            abandoned,
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_sweep(summary.elapsed, &summary.abandoned);
        }
        summary
    }

    /// Sweep every period until `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                period_ms = self.settings.period.as_millis() as u64,
                budget_ms = self.settings.budget.as_millis() as u64,
                "heartbeat sweep started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.recv() => break,
                    summary = self.sweep_once() => report(&summary),
                }
            }
            debug!("heartbeat sweep stopped");
        })
    }

    async fn check(&self, worker: String, sequence: u64) -> WorkerObservation {
        let limit = self.settings.probe_timeout;
        let daemon = match timeout(limit, self.control.query_state(&worker)).await {
            Ok(Ok(info)) => Some(info.state),
            Ok(Err(fault)) => {
                debug!(worker = %worker, error = %fault, "daemon state query failed");
                None
            }
            Err(_) => {
                debug!(worker = %worker, "daemon state query timed out");
                None
            }
        };

        let mut observation = WorkerObservation {
            worker,
            sequence,
            daemon,
            timestamp: None,
            age: None,
        };
        if daemon != Some(ProcessState::Running) {
            return observation;
        }
        match timeout(limit, self.probe.probe(&observation.worker, limit)).await {
            Ok(Ok(timestamp)) => {
                observation.timestamp = Some(timestamp);
                observation.age = Some(age_seconds(unix_now(), timestamp));
            }
            Ok(Err(fault)) => {
                debug!(worker = %observation.worker, error = %fault, "liveness probe failed");
            }
            Err(_) => {
                debug!(worker = %observation.worker, "liveness probe timed out");
            }
        }
        observation
    }

    async fn record(&self, observation: WorkerObservation) {
        let worker = observation.worker.clone();
        if let Err(err) = self.engine.record_observation(observation).await {
            warn!(worker = %worker, error = %err, "failed to record sweep observation");
        }
    }
}

fn report(summary: &SweepSummary) {
    if summary.abandoned.is_empty() {
        debug!(
            sequence = summary.sequence,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            completed = summary.completed,
            "sweep finished"
        );
    } else {
        warn!(
            sequence = summary.sequence,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            completed = summary.completed,
            abandoned = ?summary.abandoned,
            "sweep overran its budget"
        );
    }
}
