//! ---
//! dloc_section: "15-testing-qa-runbook"
//! dloc_subsection: "integration-tests"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "End-to-end tracking over the example configuration."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dloc_common::config::{AppConfig, StoreBackend};
use dloc_core::adapters::{
    CoordinateLabelResolver, ManualAvailabilityFeed, MemoryRecordStore, SimulatedGeolocation,
    StaticPermissionSource,
};
use dloc_core::{
    DriverAvailability, DriverId, StoreCallPolicy, TrackingController, TrackingState,
};
use tokio::time::{sleep, Instant};

fn example_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("configs/dlocd.example.toml");
    AppConfig::from_path(&path)
        .unwrap_or_else(|err| panic!("failed to load {}: {err:#}", path.display()))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[test]
fn example_config_is_valid() {
    let config = example_config();
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert!(config.tracking.fallback().is_ok());
    assert!(!config.simulator.route.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulated_route_keeps_record_fresh() {
    let mut config = example_config();
    config.simulator.step_interval = Duration::from_millis(20);
    let route = config.simulator.route.clone();

    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::from_config(&config.simulator);
    let controller = TrackingController::builder(
        Arc::new(store.clone()),
        Arc::new(geo.clone()),
        Arc::new(StaticPermissionSource::granted()),
    )
    .tracking_config(config.tracking.clone())
    .store_policy(StoreCallPolicy::from_config(&config.store))
    .resolver(Arc::new(CoordinateLabelResolver))
    .build()
    .unwrap();
    controller.start().await;

    let feed = ManualAvailabilityFeed::new();
    controller.attach(&feed);
    feed.set("driver-7", DriverAvailability::Busy);

    assert!(
        controller
            .wait_for_state(TrackingState::Tracking, Duration::from_secs(3))
            .await
    );
    let driver = DriverId::from("driver-7");
    let created = store.get(&driver).unwrap();
    assert_eq!(created.latitude, route[0].latitude);

    assert!(
        eventually(|| store
            .get(&driver)
            .is_some_and(|row| row.latitude != route[0].latitude))
        .await
    );
    assert!(eventually(|| controller.current_address().is_some()).await);
    assert_eq!(store.len(), 1);

    feed.set("driver-7", DriverAvailability::Offline);
    assert!(
        controller
            .wait_for_state(TrackingState::Idle, Duration::from_secs(3))
            .await
    );
    assert!(eventually(|| geo.active_watches() == 0).await);
    controller.dispose();
}
