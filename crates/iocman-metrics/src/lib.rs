//! ---
//! iocman_section: "04-observability"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Metrics collection and export utilities."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Serve `registry` at `GET /metrics` on `addr`. Port 0 picks a free port;
/// the bound address is available from [`MetricsServer::addr`].
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = bind(addr)?;
    let addr = listener
        .local_addr()
        .context("metrics listener has no local address")?;
    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);

    let (shutdown, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .await
            .context("metrics exporter failed")
    });
    info!(address = %addr, "metrics exporter listening");

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown),
        task,
    })
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("unable to bind metrics exporter to {addr}"))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener).context("unable to register metrics listener with tokio")
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, encoder.format_type())], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Running `/metrics` exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Metrics recorded by the host daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    workers_configured: IntGauge,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "iocmand_starts_total",
            "Total number of times the fleet manager daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "iocmand_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let workers_configured = IntGauge::with_opts(Opts::new(
            "iocmand_workers_configured",
            "Number of workers declared in the loaded configuration",
        ))?;
        registry.register(Box::new(workers_configured.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            workers_configured,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_worker_count(&self, count: usize) {
        self.workers_configured.set(count as i64);
    }
}

/// Metrics recorded by the reconciliation engine and heartbeat sweep.
#[derive(Clone, Debug)]
pub struct FleetMetrics {
    registry: SharedRegistry,
    transitions: IntCounterVec,
    sweep_seconds: Histogram,
    sweeps_total: IntCounter,
    abandoned: IntCounterVec,
    heartbeat_age: IntGaugeVec,
    control_state: IntGaugeVec,
}

impl FleetMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "iocman_transitions_total",
                "Completed worker transitions by command and outcome",
            ),
            &["worker", "command", "outcome"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let buckets = prometheus::exponential_buckets(0.005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let sweep_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "iocman_sweep_duration_seconds",
                "Wall time of one heartbeat sweep across all workers",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(sweep_seconds.clone()))?;

        let sweeps_total = IntCounter::with_opts(Opts::new(
            "iocman_sweeps_total",
            "Heartbeat sweeps executed",
        ))?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let abandoned = IntCounterVec::new(
            Opts::new(
                "iocman_sweep_abandoned_total",
                "Per-worker checks abandoned because the sweep overran its budget",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(abandoned.clone()))?;

        let heartbeat_age = IntGaugeVec::new(
            Opts::new(
                "iocman_heartbeat_age_seconds",
                "Last published heartbeat age per worker (sentinel when unknown)",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(heartbeat_age.clone()))?;

        let control_state = IntGaugeVec::new(
            Opts::new(
                "iocman_control_state",
                "Published control state index per worker",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(control_state.clone()))?;

        Ok(Self {
            registry,
            transitions,
            sweep_seconds,
            sweeps_total,
            abandoned,
            heartbeat_age,
            control_state,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_transition(&self, worker: &str, command: &str, outcome: &str) {
        self.transitions
            .with_label_values(&[worker, command, outcome])
            .inc();
    }

    pub fn observe_sweep(&self, elapsed: Duration, abandoned_workers: &[String]) {
        self.sweeps_total.inc();
        self.sweep_seconds.observe(elapsed.as_secs_f64());
        for worker in abandoned_workers {
            self.abandoned.with_label_values(&[worker.as_str()]).inc();
        }
    }

    pub fn set_heartbeat_age(&self, worker: &str, seconds: u32) {
        self.heartbeat_age
            .with_label_values(&[worker])
            .set(i64::from(seconds));
    }

    pub fn set_control_state(&self, worker: &str, index: i64) {
        self.control_state.with_label_values(&[worker]).set(index);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_metrics_register_once_per_registry() {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone()).expect("register");
        metrics.record_transition("magnet1", "run", "completed");
        metrics.set_heartbeat_age("magnet1", 999);
        assert!(FleetMetrics::new(registry).is_err());
    }

    #[test]
    fn sweep_observation_counts_abandoned_workers() {
        let metrics = FleetMetrics::new(new_registry()).expect("register");
        metrics.observe_sweep(Duration::from_millis(120), &["flow".to_owned()]);
        metrics.observe_sweep(Duration::from_millis(80), &["flow".to_owned()]);
        assert_eq!(metrics.sweeps_total.get(), 2);
        assert_eq!(metrics.abandoned.with_label_values(&["flow"]).get(), 2);
        assert_eq!(metrics.sweep_seconds.get_sample_count(), 2);
    }
}
