//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Shared primitives and utilities for the fleet runtime."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "IOCMAN_LOG";

/// Used when neither `IOCMAN_LOG` nor `RUST_LOG` is set. The sweep talks to
/// the daemon every period, so HTTP client internals stay at `warn`.
pub const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

/// Writer guards for stdout and the rolling file; dropping them loses
/// buffered lines, so they live for the whole process.
static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Stdout format for the daemon. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "json")]
    StructuredJson,
    Pretty,
}

/// Pick the filter directive: `IOCMAN_LOG`, then `RUST_LOG`, then
/// [`DEFAULT_DIRECTIVE`]. Blank values count as unset.
pub fn filter_directive(custom: Option<String>, standard: Option<String>) -> String {
    custom
        .into_iter()
        .chain(standard)
        .map(|directive| directive.trim().to_owned())
        .find(|directive| !directive.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

fn stdout_layer(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .compact()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber: an env filter, the configured stdout
/// format and a daily rolling JSON file `<prefix>.log` under
/// `config.directory`. Calling it again is a no-op.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive '{directive}' ({err}); using {DEFAULT_DIRECTIVE}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });

    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(stdout_layer(config.format, stdout_writer))
        .with(file_layer)
        .with(filter)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set((stdout_guard, file_guard));
        info!(
            service = service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            %directive,
            "tracing initialised"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_directive_wins() {
        assert_eq!(
            filter_directive(Some("iocman_core=debug".into()), Some("warn".into())),
            "iocman_core=debug"
        );
    }

    #[test]
    fn blank_values_fall_through() {
        assert_eq!(
            filter_directive(Some("  ".into()), Some("warn".into())),
            "warn"
        );
        assert_eq!(filter_directive(None, Some(String::new())), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn json_alias_parses() {
        let format: LogFormat = serde_yaml::from_str("json").expect("alias");
        assert_eq!(format, LogFormat::StructuredJson);
    }
}
