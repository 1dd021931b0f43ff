//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Tracing subscriber initialisation for DLOC services."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "DLOC_LOG";
/// The PostgREST client stack is chatty at `info`; keep it to warnings.
const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";

static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `DLOC_LOG` overrides the filter (e.g. `info`, `debug,dloc_core=trace`). When unset
///   `RUST_LOG` is honoured, then `info` with the HTTP client stack at `warn`.
/// * Stdout receives JSON or pretty output per `format`; a daily rolling JSON file
///   named by [`log_file_name`] is always written to `directory`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("failed to create log directory {}", config.directory.display())
    })?;

    let file_name = log_file_name(service_name, config.file_prefix.as_deref());
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set([file_guard, stdout_guard]);

    let filter = resolve_filter(std::env::var(LOG_ENV).ok().as_deref());

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .flatten_event(true)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    // driver/session/state fields land at the top level of each file line
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .flatten_event(true)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_file = %config.directory.join(&file_name).display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

/// Base name of the rolling log file; the appender adds a date suffix.
pub fn log_file_name(service_name: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !prefix.trim().is_empty() => format!("{}-{service_name}.log", prefix.trim()),
        _ => format!("{service_name}.log"),
    }
}

/// `DLOC_LOG` wins when it parses; otherwise `RUST_LOG`, then the default.
fn resolve_filter(explicit: Option<&str>) -> EnvFilter {
    if let Some(directive) = explicit {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!(
                "invalid {LOG_ENV} directive '{directive}' ({err}); using {DEFAULT_DIRECTIVE}"
            ),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}
