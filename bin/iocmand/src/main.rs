//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "binary"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Binary entrypoint for the IOC fleet manager daemon."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use iocman_bus::{
    spawn_api_server, ApiServer, BusLivenessProbe, HttpPointReader, InMemoryPointBus, PointBus,
    PointReader,
};
use iocman_common::config::{FleetConfig, LivenessSource};
use iocman_common::logging::{init_tracing, LogFormat};
use iocman_control::SupervisorClient;
use iocman_core::programs::{render_programs, write_program_config};
use iocman_core::{FleetDeps, FleetHost, WorkerRegistry};
use iocman_metrics::{new_registry, spawn_http_server, DaemonMetrics, FleetMetrics};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "IOC fleet manager daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "IOCMAN_CONFIG",
        value_name = "FILE",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the stdout log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Supervise the configured workers")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
    #[command(about = "Print the daemon program sections for every worker")]
    RenderPrograms {
        #[arg(long, help = "Write to control.program_config instead of stdout")]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/iocman.yaml"));
    candidates.push(PathBuf::from("/etc/iocman/iocman.yaml"));

    let load_started = Instant::now();
    let loaded = FleetConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("iocmand", &config.logging)?;
            info!(
                source = %loaded.source.display(),
                workers = config.workers.len(),
                "configuration loaded"
            );
            run_daemon(config, load_duration).await?;
        }
        Commands::CheckConfig => {
            let registry = WorkerRegistry::from_config(&config)?;
            println!(
                "{}: ok ({} workers, {} autostart)",
                loaded.source.display(),
                registry.len(),
                registry.autostart().count()
            );
        }
        Commands::RenderPrograms { write } => {
            let registry = WorkerRegistry::from_config(&config)?;
            if write {
                let path = config
                    .control
                    .program_config
                    .as_deref()
                    .context("control.program_config is not set")?;
                write_program_config(path, &registry)?;
                println!("wrote {}", path.display());
            } else {
                print!("{}", render_programs(&registry));
            }
        }
    }

    Ok(())
}

async fn run_daemon(config: FleetConfig, load_duration: Duration) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.set_worker_count(config.workers.len());
    let fleet_metrics = FleetMetrics::new(metrics_registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(metrics_registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let client =
        SupervisorClient::from_endpoint(&config.control.endpoint, config.general.rpc_timeout)
            .context("invalid control endpoint")?;
    info!(endpoint = %client.describe(), "control plane configured");

    let bus = InMemoryPointBus::new();
    let shared_bus: Arc<dyn PointBus> = Arc::new(bus.clone());
    let reader: Arc<dyn PointReader> = match &config.bus.liveness {
        LivenessSource::Local => {
            if !config.bus.api.enabled {
                warn!("liveness is read locally but the point api is disabled; workers cannot refresh their timestamps");
            }
            Arc::new(bus)
        }
        LivenessSource::Http { url } => {
            info!(gateway = %url, "reading liveness from remote point gateway");
            Arc::new(HttpPointReader::new(url.clone())?)
        }
    };
    let probe = Arc::new(BusLivenessProbe::new(reader, config.general.prefix.clone()));

    let mut api_server: Option<ApiServer> = None;
    if config.bus.api.enabled {
        match spawn_api_server(shared_bus.clone(), config.bus.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "point api listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to start point api");
            }
        }
    } else {
        info!("point api disabled by configuration");
    }

    let host = FleetHost::new(
        config,
        FleetDeps {
            control: Arc::new(client),
            bus: shared_bus,
            probe,
            metrics: Some(fleet_metrics),
        },
    )?;
    let handle = host.start().await?;

    info!("daemon running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        park_after_failure("Ctrl+C", err).await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => park_after_failure("SIGTERM", err).await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// A handler that cannot be installed must not count as a received signal;
/// the other handler still decides when to stop.
async fn park_after_failure(handler: &str, err: std::io::Error) {
    warn!(?err, handler, "failed to install signal handler");
    std::future::pending::<()>().await;
}
