//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Desired-state table of workers, built once from configuration.
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use iocman_common::{FleetConfig, WorkerConfig};

use crate::errors::RegistryError;

/// Immutable launch description of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    /// Launch command with placeholders already substituted.
    pub command: String,
    pub directory: Option<PathBuf>,
    pub stdout_logfile: PathBuf,
    pub stderr_logfile: PathBuf,
    pub autostart: bool,
    pub startsecs: u32,
    pub startretries: u32,
    pub environment: IndexMap<String, String>,
}

impl WorkerSpec {
    /// Spec with default command and log files under `log_dir`.
    pub fn new(name: impl Into<String>, log_dir: &Path) -> Self {
        Self::from_config(name.into(), &WorkerConfig::default(), log_dir)
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    fn from_config(name: String, config: &WorkerConfig, log_dir: &Path) -> Self {
        let command = render_command(&config.command, &name, config.directory.as_deref());
        let stdout_logfile = config
            .stdout_logfile
            .clone()
            .unwrap_or_else(|| log_dir.join(format!("{name}.log")));
        let stderr_logfile = config
            .stderr_logfile
            .clone()
            .unwrap_or_else(|| log_dir.join(format!("{name}_error.log")));
        Self {
            name,
            command,
            directory: config.directory.clone(),
            stdout_logfile,
            stderr_logfile,
            autostart: config.autostart,
            startsecs: config.startsecs,
            startretries: config.startretries,
            environment: config.environment.clone(),
        }
    }
}

/// Substitute `{name}` and `{directory}` in a command template.
pub fn render_command(template: &str, name: &str, directory: Option<&Path>) -> String {
    let directory = directory
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| ".".to_owned());
    template
        .replace("{name}", name)
        .replace("{directory}", &directory)
}

/// Read-only worker table keyed by name, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: IndexMap<String, WorkerSpec>,
}

impl WorkerRegistry {
    pub fn from_config(config: &FleetConfig) -> Result<Self, RegistryError> {
        Self::from_specs(config.workers.iter().map(|(name, worker)| {
            WorkerSpec::from_config(name.clone(), worker, &config.control.log_dir)
        }))
    }

    pub fn from_specs(specs: impl IntoIterator<Item = WorkerSpec>) -> Result<Self, RegistryError> {
        let mut workers = IndexMap::new();
        for spec in specs {
            validate_name(&spec.name)?;
            if workers.contains_key(&spec.name) {
                return Err(RegistryError::Duplicate(spec.name));
            }
            workers.insert(spec.name.clone(), spec);
        }
        Ok(Self { workers })
    }

    pub fn all(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers.values()
    }

    pub fn get(&self, name: &str) -> Result<&WorkerSpec, RegistryError> {
        self.workers
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Workers included when a command targets `All`.
    pub fn autostart(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers.values().filter(|spec| spec.autostart)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let invalid = |reason| RegistryError::InvalidName {
        name: name.to_owned(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(invalid("contains ':' or whitespace"));
    }
    if name == "all" {
        return Err(invalid("reserved for bulk control"));
    }
    Ok(())
}
