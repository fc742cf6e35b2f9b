//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use iocman_bus::{LivenessProbe, PointBus, PointValue, PointWrite};
use iocman_common::FleetConfig;
use iocman_control::ControlPlane;
use iocman_metrics::FleetMetrics;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bulk::BulkControl;
use crate::engine::{EngineSettings, ReconciliationEngine, TransitionTicket};
use crate::programs::sync_programs;
use crate::registry::WorkerRegistry;
use crate::state::{Command, Target};
use crate::sweep::{HeartbeatSweep, SweepSettings};

/// External collaborators the fleet runs against.
#[derive(Clone)]
pub struct FleetDeps {
    pub control: Arc<dyn ControlPlane>,
    pub bus: Arc<dyn PointBus>,
    pub probe: Arc<dyn LivenessProbe>,
    pub metrics: Option<FleetMetrics>,
}

/// Fleet manager entrypoint.
pub struct FleetHost {
    config: FleetConfig,
    registry: Arc<WorkerRegistry>,
    deps: FleetDeps,
}

impl FleetHost {
    pub fn new(config: FleetConfig, deps: FleetDeps) -> Result<Self> {
        let registry =
            WorkerRegistry::from_config(&config).context("failed to build worker registry")?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
            deps,
        })
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Sync daemon programs, publish initial points and start every task.
    pub async fn start(self) -> Result<FleetHandle> {
        let FleetDeps {
            control,
            bus,
            probe,
            metrics,
        } = self.deps;

        if let Some(path) = &self.config.control.program_config {
            if let Err(err) = sync_programs(control.as_ref(), &self.registry, path).await {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "program sync failed; continuing with the daemon's current configuration"
                );
            }
        }

        let (shutdown_tx, _) = broadcast::channel(16);
        let engine = ReconciliationEngine::new(
            &self.registry,
            EngineSettings::from_config(&self.config),
            control.clone(),
            bus.clone(),
            metrics.clone(),
        );
        engine.publish_all().await;

        let bulk = BulkControl::new(engine.clone(), self.registry.clone(), bus.clone());
        bulk.publish(Command::Stop).await;

        let worker_tasks = engine.spawn_workers(&shutdown_tx);
        let sweep_task = HeartbeatSweep::new(
            engine.clone(),
            control,
            probe,
            SweepSettings::from_config(&self.config),
            metrics,
        )
        .spawn(shutdown_tx.subscribe());
        let listener_task = spawn_write_listener(
            engine.clone(),
            bulk.clone(),
            self.config.general.prefix.clone(),
            bus.subscribe_writes(),
            shutdown_tx.subscribe(),
        );

        info!(
            workers = self.registry.len(),
            prefix = %self.config.general.prefix,
            "fleet started"
        );

        Ok(FleetHandle {
            shutdown: shutdown_tx,
            engine,
            bulk,
            registry: self.registry,
            worker_tasks,
            sweep_task,
            listener_task,
        })
    }
}

/// Running fleet. Dropping it without [`FleetHandle::shutdown`] leaves the
/// tasks running until the runtime stops.
pub struct FleetHandle {
    shutdown: broadcast::Sender<()>,
    engine: ReconciliationEngine,
    bulk: BulkControl,
    registry: Arc<WorkerRegistry>,
    worker_tasks: Vec<JoinHandle<()>>,
    sweep_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl FleetHandle {
    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn bulk(&self) -> &BulkControl {
        &self.bulk
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Dispatch a command. A single worker yields its ticket; `All` is
    /// fire-and-forget.
    pub async fn dispatch(
        &self,
        target: Target,
        command: Command,
    ) -> crate::Result<Option<TransitionTicket>> {
        match target {
            Target::Worker(worker) => Ok(Some(self.engine.submit(&worker, command)?)),
            Target::All => {
                self.bulk.apply_all(command).await;
                Ok(None)
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Err(err) = self.sweep_task.await {
            error!(error = %err, "sweep task join error");
        }
        if let Err(err) = self.listener_task.await {
            error!(error = %err, "write listener join error");
        }
        for handle in self.worker_tasks {
            if let Err(err) = handle.await {
                error!(error = %err, "transition task join error");
            }
        }
        info!("fleet shutdown complete");
        Ok(())
    }
}

/// How an external point write maps onto the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlWrite {
    Command(Target, Command),
    /// A control point received a value that is not a command index.
    Invalid { target: Target, value: PointValue },
    /// Not a control point (e.g. a worker refreshing its `_time`).
    Ignored,
}

pub fn route_write(prefix: &str, write: &PointWrite) -> ControlWrite {
    let Some(local) = write
        .name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
    else {
        return ControlWrite::Ignored;
    };
    let target = if local == "all" {
        Target::All
    } else if let Some(worker) = local.strip_suffix("_control") {
        Target::Worker(worker.to_owned())
    } else {
        return ControlWrite::Ignored;
    };
    match write.value.as_i64().and_then(Command::from_index) {
        Some(command) => ControlWrite::Command(target, command),
        None => ControlWrite::Invalid {
            target,
            value: write.value.clone(),
        },
    }
}

fn spawn_write_listener(
    engine: ReconciliationEngine,
    bulk: BulkControl,
    prefix: String,
    mut writes: broadcast::Receiver<PointWrite>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = writes.recv() => match received {
                    Ok(write) => handle_write(&engine, &bulk, &prefix, write).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "point writes dropped before they could be handled");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("write listener stopped");
    })
}

async fn handle_write(
    engine: &ReconciliationEngine,
    bulk: &BulkControl,
    prefix: &str,
    write: PointWrite,
) {
    match route_write(prefix, &write) {
        ControlWrite::Command(Target::Worker(worker), command) => {
            if let Err(err) = engine.submit(&worker, command) {
                warn!(point = %write.name, error = %err, "write to unknown worker ignored");
            }
        }
        ControlWrite::Command(Target::All, command) => {
            bulk.apply_all(command).await;
        }
        ControlWrite::Invalid { target, value } => {
            warn!(point = %write.name, value = %value, "invalid command value");
            if let Target::Worker(worker) = target {
                if let Err(err) = engine.republish(&worker).await {
                    debug!(worker = %worker, error = %err, "nothing to restore");
                }
            }
        }
        ControlWrite::Ignored => {}
    }
}
