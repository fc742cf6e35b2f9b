//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Daemon program sections for the configured workers.
//!
//! The manager owns one include file holding a `[program:<worker>]` section
//! per worker. It is rewritten at startup, after which the daemon is asked to
//! reload and any newly added groups are activated.
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use iocman_control::{ConfigChanges, ControlPlane};
use tracing::{info, warn};

use crate::registry::{WorkerRegistry, WorkerSpec};

const HEADER: &str = "; Generated by iocman. Changes are overwritten at startup.\n";

/// Render one `[program:x]` section. The daemon never autostarts workers;
/// starting is always an explicit command from the manager.
pub fn render_program(spec: &WorkerSpec) -> String {
    let mut section = String::new();
    let _ = writeln!(section, "[program:{}]", spec.name);
    let _ = writeln!(section, "command={}", spec.command);
    if let Some(directory) = &spec.directory {
        let _ = writeln!(section, "directory={}", directory.display());
    }
    section.push_str("autostart=false\n");
    section.push_str("autorestart=false\n");
    let _ = writeln!(section, "startsecs={}", spec.startsecs);
    let _ = writeln!(section, "startretries={}", spec.startretries);
    let _ = writeln!(section, "stdout_logfile={}", spec.stdout_logfile.display());
    let _ = writeln!(section, "stderr_logfile={}", spec.stderr_logfile.display());
    if !spec.environment.is_empty() {
        let pairs: Vec<String> = spec
            .environment
            .iter()
            .map(|(key, value)| format!("{key}=\"{}\"", value.replace('"', "\\\"")))
            .collect();
        let _ = writeln!(section, "environment={}", pairs.join(","));
    }
    section
}

/// Render the whole include file.
pub fn render_programs(registry: &WorkerRegistry) -> String {
    let sections: Vec<String> = registry.all().map(render_program).collect();
    format!("{HEADER}\n{}", sections.join("\n"))
}

pub fn write_program_config(path: &Path, registry: &WorkerRegistry) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create directory {}", parent.display()))?;
    }
    fs::write(path, render_programs(registry))
        .with_context(|| format!("unable to write program config {}", path.display()))?;
    info!(path = %path.display(), workers = registry.len(), "program config written");
    Ok(())
}

/// Write the include file, reload the daemon and activate added groups.
///
/// A group that fails to activate is logged and skipped; the remaining groups
/// are still added.
pub async fn sync_programs(
    control: &dyn ControlPlane,
    registry: &WorkerRegistry,
    path: &Path,
) -> Result<ConfigChanges> {
    write_program_config(path, registry)?;
    let changes = control
        .reload_config()
        .await
        .context("daemon rejected configuration reload")?;
    for group in &changes.added {
        match control.add_process_group(group).await {
            Ok(()) => info!(group = %group, "process group added"),
            Err(err) => warn!(group = %group, error = %err, "failed to add process group"),
        }
    }
    if !changes.changed.is_empty() || !changes.removed.is_empty() {
        info!(
            changed = ?changes.changed,
            removed = ?changes.removed,
            "daemon reported program changes needing a manual update"
        );
    }
    Ok(changes)
}
