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

use iocman_bus::{qualified_name, PointBus, PointValue};
use tracing::{info, warn};

use crate::engine::ReconciliationEngine;
use crate::registry::WorkerRegistry;
use crate::state::Command;

/// Applies one command to every autostart worker.
#[derive(Clone)]
pub struct BulkControl {
    engine: ReconciliationEngine,
    registry: Arc<WorkerRegistry>,
    bus: Arc<dyn PointBus>,
    all_point: String,
}

impl BulkControl {
    pub fn new(
        engine: ReconciliationEngine,
        registry: Arc<WorkerRegistry>,
        bus: Arc<dyn PointBus>,
    ) -> Self {
        let all_point = qualified_name(&engine.settings().prefix, "all");
        Self {
            engine,
            registry,
            bus,
            all_point,
        }
    }

    pub fn all_point(&self) -> &str {
        &self.all_point
    }

    /// Submit `command` to each autostart worker without waiting for any of
    /// them. Returns the workers the command was handed to.
    pub async fn apply_all(&self, command: Command) -> Vec<String> {
        self.publish(command).await;
        let mut dispatched = Vec::new();
        for spec in self.registry.autostart() {
            match self.engine.submit(&spec.name, command) {
                Ok(_ticket) => dispatched.push(spec.name.clone()),
                Err(err) => warn!(worker = %spec.name, error = %err, "bulk dispatch failed"),
            }
        }
        info!(%command, workers = dispatched.len(), "bulk command dispatched");
        dispatched
    }

    /// Publish the `all` point with `command` as its value.
    pub async fn publish(&self, command: Command) {
        if let Err(err) = self
            .bus
            .publish(
                &self.all_point,
                PointValue::Int(command.index()),
                command.severity(),
            )
            .await
        {
            warn!(point = %self.all_point, error = %err, "failed to publish point");
        }
    }
}
