//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "binary"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Binary entrypoint for the DLOC daemon."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use dloc_common::config::{AppConfig, StoreBackend, StoreConfig};
use dloc_common::logging::init_tracing;
use dloc_core::adapters::{
    CoordinateLabelResolver, ManualAvailabilityFeed, MemoryRecordStore, PostgrestConfig,
    PostgrestRecordStore, RecordStore, SimulatedGeolocation, StaticPermissionSource,
};
use dloc_core::model::PermissionStatus;
use dloc_core::{
    DriverAvailability, DriverId, DriverStatus, ReconcilerConfig, RecordReconciler,
    StoreCallPolicy, TrackingController, TrackingMetrics,
};
use dloc_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "DLOC driver location daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Track availability read from stdin as `<driver> <status>` or `clear`")]
    Run,
    #[command(about = "Ensure a location record exists for one driver and exit")]
    Reconcile {
        #[arg(long, help = "Driver identity")]
        driver: String,
    },
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/dlocd.toml"));
    candidates.push(PathBuf::from("configs/dlocd.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    init_tracing("dlocd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), config.store.backend.as_str());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!(
                "configuration {} is valid (store backend: {})",
                loaded.source.display(),
                config.store.backend.as_str()
            );
            Ok(())
        }
        Commands::Reconcile { driver } => reconcile_once(&config, DriverId::new(driver)).await,
        Commands::Run => {
            let metrics = TrackingMetrics::new(registry.clone())?;
            let server = if config.metrics.enabled {
                let server = spawn_http_server(registry, config.metrics.listen).await?;
                info!(address = %server.addr(), "metrics exporter enabled");
                Some(server)
            } else {
                info!("metrics exporter disabled by configuration");
                None
            };
            let result = run_daemon(&config, metrics).await;
            if let Some(server) = server {
                server.shutdown().await?;
            }
            result
        }
    }
}

fn build_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("memory record store selected; records are lost on exit");
            Ok(Arc::new(MemoryRecordStore::new()))
        }
        StoreBackend::Postgrest => {
            let settings = PostgrestConfig::from_store_config(config)?;
            let store = PostgrestRecordStore::new(settings)?;
            info!(endpoint = %store.endpoint(), "postgrest record store selected");
            Ok(Arc::new(store))
        }
    }
}

async fn reconcile_once(config: &AppConfig, driver: DriverId) -> Result<()> {
    let store = build_store(&config.store)?;
    let geo = Arc::new(SimulatedGeolocation::from_config(&config.simulator));
    let reconciler = RecordReconciler::new(
        store,
        geo,
        ReconcilerConfig::from_tracking(&config.tracking)?,
    )
    .with_policy(StoreCallPolicy::from_config(&config.store));

    let report = reconciler.reconcile(&driver).await;
    let summary = serde_json::json!({
        "driver": report.driver,
        "outcome": report.label(),
        "record": report.record(),
        "elapsed_ms": report.elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !report.succeeded() {
        bail!("location record for driver {driver} could not be written");
    }
    Ok(())
}

async fn run_daemon(config: &AppConfig, metrics: TrackingMetrics) -> Result<()> {
    let store = build_store(&config.store)?;
    let geo = Arc::new(SimulatedGeolocation::from_config(&config.simulator));
    let answer = if config.simulator.grant_permission {
        PermissionStatus::Granted
    } else {
        PermissionStatus::Denied
    };
    let permissions = Arc::new(StaticPermissionSource::prompting(answer));

    let controller = TrackingController::builder(store, geo, permissions)
        .tracking_config(config.tracking.clone())
        .store_policy(StoreCallPolicy::from_config(&config.store))
        .resolver(Arc::new(CoordinateLabelResolver))
        .metrics(metrics)
        .build()?;

    let permission = controller.start().await;
    info!(?permission, "tracking controller ready");

    let feed = ManualAvailabilityFeed::new();
    controller.attach(&feed);

    let mut snapshots = controller.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last = None;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            let key = (snapshot.state, snapshot.driver.clone(), snapshot.session_id);
            if last.as_ref() != Some(&key) {
                info!(
                    state = snapshot.state.as_str(),
                    driver = snapshot.driver.as_ref().map(DriverId::as_str).unwrap_or(""),
                    tracking = snapshot.is_tracking,
                    "tracking state changed"
                );
                last = Some(key);
            }
        }
    });

    info!("reading availability events from stdin; ctrl-c to stop");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("ctrl-c received; shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => match parse_event(&line) {
                        Ok(Some(status)) => feed.publish(status),
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "ignoring availability event"),
                    },
                    None => {
                        info!("stdin closed; waiting for ctrl-c");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    controller.dispose();
    reporter.abort();
    Ok(())
}

/// `Ok(None)` for blank lines, `Ok(Some(None))` for `clear`.
fn parse_event(line: &str) -> Result<Option<Option<DriverStatus>>> {
    let mut parts = line.split_whitespace();
    let Some(first) = parts.next() else {
        return Ok(None);
    };
    if first.eq_ignore_ascii_case("clear") {
        return Ok(Some(None));
    }
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("expected `<driver> <status>`, got '{line}'"))?;
    let availability: DriverAvailability = status.parse().map_err(|err: String| anyhow!(err))?;
    if parts.next().is_some() {
        bail!("unexpected trailing input in '{line}'");
    }
    Ok(Some(Some(DriverStatus::new(first, availability))))
}
