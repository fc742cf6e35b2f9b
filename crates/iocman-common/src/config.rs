//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Shared primitives and utilities for the fleet runtime."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_prefix() -> String {
    "IOC:MAN".to_owned()
}

fn default_sweep_period() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_overrun_factor() -> f64 {
    1.5
}

fn default_reset_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_sentinel() -> u32 {
    999
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/supervisor_ioc.sock")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("ioc-supervisor/logs")
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_worker_command() -> String {
    "python master_ioc.py -i {name}".to_owned()
}

fn default_startsecs() -> u32 {
    3
}

fn default_startretries() -> u32 {
    3
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5065))
}

/// Primary configuration object for the fleet manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub workers: IndexMap<String, WorkerConfig>,
}

/// Metadata describing where a [`FleetConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedFleetConfig {
    pub config: FleetConfig,
    pub source: PathBuf,
}

impl FleetConfig {
    pub const ENV_CONFIG_PATH: &'static str = "IOCMAN_CONFIG";

    /// Load configuration from disk, respecting the `IOCMAN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedFleetConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedFleetConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedFleetConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a single configuration file. `.toml` files are read as TOML,
    /// everything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            toml::from_str::<FleetConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            serde_yaml::from_str::<FleetConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a worker configuration by name.
    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(anyhow!("configuration must declare at least one worker"));
        }
        for (name, worker) in &self.workers {
            validate_worker_name(name)?;
            if worker.command.trim().is_empty() {
                return Err(anyhow!("worker '{}' has an empty command", name));
            }
        }
        self.general.validate()?;
        self.control.retry.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for FleetConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: FleetConfig =
            serde_yaml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_worker_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("worker names must not be empty"));
    }
    if name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(anyhow!(
            "worker name '{}' must not contain ':' or whitespace",
            name
        ));
    }
    if name == "all" || name == "general" {
        return Err(anyhow!("worker name '{}' is reserved", name));
    }
    Ok(())
}

/// Sweep timing and point naming shared by every worker.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Device prefix prepended to every point name (`<prefix>:<worker>_control`).
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_sweep_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_period: Duration,
    /// Age beyond which a live heartbeat is classified stale. Defaults to two sweep periods.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub stale_threshold: Option<Duration>,
    #[serde(default = "default_probe_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    #[serde(default = "default_rpc_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub rpc_timeout: Duration,
    /// Multiple of the sweep period after which unfinished probes are abandoned.
    #[serde(default = "default_overrun_factor")]
    pub sweep_overrun_factor: f64,
    #[serde(default = "default_reset_settle")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_settle: Duration,
    #[serde(default = "default_heartbeat_sentinel")]
    pub heartbeat_sentinel: u32,
}

impl GeneralConfig {
    pub fn effective_stale_threshold(&self) -> Duration {
        self.stale_threshold.unwrap_or(self.sweep_period * 2)
    }

    /// Upper bound on the wall time a single sweep may take.
    pub fn sweep_budget(&self) -> Duration {
        self.sweep_period.mul_f64(self.sweep_overrun_factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(anyhow!("general.prefix must not be empty"));
        }
        if self.sweep_period.is_zero() {
            return Err(anyhow!("general.sweep_period must be greater than zero"));
        }
        if self.probe_timeout.is_zero() || self.rpc_timeout.is_zero() {
            return Err(anyhow!("probe and rpc timeouts must be greater than zero"));
        }
        if self.probe_timeout >= self.sweep_period {
            return Err(anyhow!(
                "general.probe_timeout ({:?}) must be shorter than the sweep period ({:?})",
                self.probe_timeout,
                self.sweep_period
            ));
        }
        if !self.sweep_overrun_factor.is_finite() || self.sweep_overrun_factor < 1.0 {
            return Err(anyhow!("general.sweep_overrun_factor must be at least 1.0"));
        }
        Ok(())
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            sweep_period: default_sweep_period(),
            stale_threshold: None,
            probe_timeout: default_probe_timeout(),
            rpc_timeout: default_rpc_timeout(),
            sweep_overrun_factor: default_overrun_factor(),
            reset_settle: default_reset_settle(),
            heartbeat_sentinel: default_heartbeat_sentinel(),
        }
    }
}

/// How the manager reaches the process-control daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEndpoint {
    Unix { path: PathBuf },
    Http { url: Url },
}

impl Default for ControlEndpoint {
    fn default() -> Self {
        ControlEndpoint::Unix {
            path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub endpoint: ControlEndpoint,
    #[serde(default)]
    pub retry: RetryConfig,
    /// When set, program sections for every worker are written here before the
    /// daemon is asked to reload.
    #[serde(default)]
    pub program_config: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: ControlEndpoint::default(),
            retry: RetryConfig::default(),
            program_config: None,
            log_dir: default_log_dir(),
        }
    }
}

/// Backoff applied when the daemon is unreachable during a transition.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_retry_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("control.retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_retry_base_delay(),
            jitter: default_retry_jitter(),
        }
    }
}

/// Where liveness timestamps are read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LivenessSource {
    /// The manager's own point table, refreshed by workers through the point API.
    #[default]
    Local,
    /// A remote point gateway speaking the same HTTP API.
    Http { url: Url },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub liveness: LivenessSource,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Launch description for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command template; `{name}` and `{directory}` are substituted at render time.
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub stdout_logfile: Option<PathBuf>,
    #[serde(default)]
    pub stderr_logfile: Option<PathBuf>,
    #[serde(default)]
    pub autostart: bool,
    /// Seconds a process must stay up before the daemon reports it started.
    #[serde(default = "default_startsecs")]
    pub startsecs: u32,
    #[serde(default = "default_startretries")]
    pub startretries: u32,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            directory: None,
            stdout_logfile: None,
            stderr_logfile: None,
            autostart: false,
            startsecs: default_startsecs(),
            startretries: default_startretries(),
            environment: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
