//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Controller lifecycle scenarios driven through availability changes."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dloc_common::config::{FallbackCoordinate, Platform, TrackingConfig};
use dloc_core::adapters::{
    CoordinateLabelResolver, ManualAvailabilityFeed, MemoryRecordStore, SimulatedGeolocation,
    StaticPermissionSource, StoreOp,
};
use dloc_core::{
    ActivationOutcome, Coordinate, DriverAvailability, DriverId, DriverStatus, LocationRecord,
    PermissionState, StoreCallPolicy, StoreError, TrackingController, TrackingError,
    TrackingMetrics, TrackingState, Transition,
};
use dloc_metrics::new_registry;
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    store: MemoryRecordStore,
    geo: SimulatedGeolocation,
    permissions: Arc<StaticPermissionSource>,
    metrics: TrackingMetrics,
    controller: TrackingController,
}

fn tracking_config() -> TrackingConfig {
    TrackingConfig {
        platform: Platform::Native,
        acquisition_timeout: Duration::from_millis(100),
        fallback: Some(FallbackCoordinate::new(12.7401984, 77.824)),
        ..TrackingConfig::default()
    }
}

fn harness_with(permissions: StaticPermissionSource) -> Harness {
    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::fixed(Coordinate::new(12.93, 77.62).with_accuracy(6.0));
    let permissions = Arc::new(permissions);
    let metrics = TrackingMetrics::new(new_registry()).unwrap();
    let controller = TrackingController::builder(
        Arc::new(store.clone()),
        Arc::new(geo.clone()),
        permissions.clone(),
    )
    .tracking_config(tracking_config())
    .store_policy(StoreCallPolicy::new(
        Duration::from_millis(500),
        1,
        Duration::from_millis(1),
        Duration::ZERO,
    ))
    .resolver(Arc::new(CoordinateLabelResolver))
    .metrics(metrics.clone())
    .build()
    .unwrap();
    Harness {
        store,
        geo,
        permissions,
        metrics,
        controller,
    }
}

fn harness() -> Harness {
    harness_with(StaticPermissionSource::granted())
}

fn online(driver: &str) -> Option<DriverStatus> {
    Some(DriverStatus::new(driver, DriverAvailability::Online))
}

fn offline(driver: &str) -> Option<DriverStatus> {
    Some(DriverStatus::new(driver, DriverAvailability::Offline))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

async fn activate(controller: &TrackingController, status: Option<DriverStatus>) -> ActivationOutcome {
    match controller.apply_availability(status) {
        Transition::Activated(activation) => activation.outcome().await,
        other => panic!("expected activation, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_checks_permission_once() {
    let h = harness_with(StaticPermissionSource::prompting(
        dloc_core::PermissionStatus::Granted,
    ));
    assert_eq!(h.controller.start().await, PermissionState::Unknown);
    assert_eq!(h.controller.start().await, PermissionState::Unknown);
    assert_eq!(h.permissions.prompts(), 0);

    assert!(h.controller.request_location_permission().await);
    assert_eq!(h.controller.snapshot().permission, PermissionState::Granted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_on_first_activation_tracks_with_fallback_record() {
    let h = harness();
    h.geo.set_reply_delay(Some(Duration::from_secs(30)));
    let feed = ManualAvailabilityFeed::new();
    h.controller.start().await;
    h.controller.attach(&feed);

    feed.set("D1", DriverAvailability::Online);

    assert!(h.controller.wait_for_state(TrackingState::Tracking, WAIT).await);
    let row = h.store.get(&DriverId::from("D1")).unwrap();
    assert_eq!((row.latitude, row.longitude), (12.7401984, 77.824));
    assert!(h.controller.is_tracking());
    assert_eq!(h.geo.watches_opened(), 1);
    assert_eq!(h.metrics.active_sessions(), 1);
    h.controller.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_record_forces_no_write() {
    let h = harness();
    h.store.insert(LocationRecord::from_coordinate(
        DriverId::from("D2"),
        &Coordinate::new(1.0, 2.0),
        Utc::now(),
    ));
    h.controller.apply_availability(offline("D2"));

    assert!(h.controller.force_create_location_record().await);
    assert_eq!(h.store.calls().writes(), 0);
    assert_eq!(h.controller.state(), TrackingState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_record_keeps_controller_idle() {
    let h = harness();
    h.store
        .fail_always(StoreOp::Upsert, StoreError::Transport("service unavailable".into()));

    let outcome = activate(&h.controller, online("D1")).await;

    assert_eq!(outcome, ActivationOutcome::RecordFailed);
    assert_eq!(h.controller.state(), TrackingState::Idle);
    assert_eq!(h.geo.watches_opened(), 0);
    assert!(!h.controller.is_tracking());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_online_offline_opens_and_closes_one_subscription() {
    let h = harness();
    let feed = ManualAvailabilityFeed::new();
    h.controller.attach(&feed);

    feed.set("D1", DriverAvailability::Offline);
    feed.set("D1", DriverAvailability::Online);
    assert!(h.controller.wait_for_state(TrackingState::Tracking, WAIT).await);
    assert_eq!(h.metrics.reconciliations("written"), 1);
    assert_eq!(h.geo.watches_opened(), 1);
    assert_eq!(h.geo.active_watches(), 1);

    feed.set("D1", DriverAvailability::Offline);
    assert!(h.controller.wait_for_state(TrackingState::Idle, WAIT).await);
    assert!(eventually(|| h.geo.active_watches() == 0).await);
    assert_eq!(h.geo.watches_opened(), 1);
    assert_eq!(h.metrics.active_sessions(), 0);
    assert!(h.controller.detach());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn superseded_activation_does_not_subscribe() {
    let h = harness();
    h.store.set_latency(Some(Duration::from_millis(50)));

    let Transition::Activated(activation) = h.controller.apply_availability(online("D1")) else {
        panic!("expected activation");
    };
    assert!(matches!(
        h.controller.apply_availability(offline("D1")),
        Transition::Deactivated
    ));

    assert_eq!(activation.outcome().await, ActivationOutcome::Superseded);
    assert_eq!(h.geo.watches_opened(), 0);
    assert_eq!(h.controller.state(), TrackingState::Idle);
    // the in-flight reconciliation still completed its write
    assert_eq!(h.store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn switching_driver_restarts_tracking() {
    let h = harness();
    assert_eq!(activate(&h.controller, online("D1")).await, ActivationOutcome::Tracking);
    let first_session = h.controller.snapshot().session_id;

    assert_eq!(activate(&h.controller, online("D2")).await, ActivationOutcome::Tracking);

    assert_eq!(h.controller.driver(), Some(DriverId::from("D2")));
    assert_ne!(h.controller.snapshot().session_id, first_session);
    assert_eq!(h.store.len(), 2);
    assert!(eventually(|| h.geo.active_watches() == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_permission_blocks_tracking() {
    let h = harness_with(StaticPermissionSource::denied());

    let outcome = activate(&h.controller, online("D1")).await;

    assert_eq!(
        outcome,
        ActivationOutcome::SessionFailed(TrackingError::PermissionDenied)
    );
    assert_eq!(h.controller.state(), TrackingState::Idle);
    assert_eq!(h.store.len(), 1);
    assert_eq!(
        h.controller.start_location_tracking().await,
        Err(TrackingError::PermissionDenied)
    );
    assert_eq!(h.controller.permission(), PermissionState::Denied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixes_update_record_and_snapshot() {
    let h = harness();
    assert_eq!(activate(&h.controller, online("D1")).await, ActivationOutcome::Tracking);
    let mut updates = h.controller.subscribe();

    assert_eq!(h.geo.emit(Coordinate::new(13.0, 77.7).with_motion(90.0, 8.5)), 1);

    assert!(eventually(|| h.metrics.position_updates(true) == 1).await);
    let row = h.store.get(&DriverId::from("D1")).unwrap();
    assert_eq!((row.latitude, row.longitude, row.speed), (13.0, 77.7, Some(8.5)));

    let snapshot = updates
        .wait_for(|snapshot| snapshot.current_address.is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.current_location.unwrap().coordinate.latitude, 13.0);
    assert_eq!(snapshot.current_address.as_deref(), Some("13.00000, 77.70000"));
    assert!(snapshot.is_tracking);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_position_write_keeps_session() {
    let h = harness();
    assert_eq!(activate(&h.controller, online("D1")).await, ActivationOutcome::Tracking);
    h.store
        .fail_always(StoreOp::Update, StoreError::Transport("gateway timeout".into()));

    h.geo.emit(Coordinate::new(13.0, 77.7));

    assert!(eventually(|| h.metrics.position_updates(false) == 1).await);
    assert!(h.controller.is_tracking());
    assert_eq!(h.controller.state(), TrackingState::Tracking);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_start_and_stop_are_idempotent() {
    let h = harness();
    h.controller.apply_availability(offline("D1"));

    h.controller.start_location_tracking().await.unwrap();
    h.controller.start_location_tracking().await.unwrap();
    assert_eq!(h.geo.watches_opened(), 1);
    assert_eq!(h.controller.state(), TrackingState::Tracking);

    assert!(h.controller.stop_location_tracking());
    assert!(!h.controller.stop_location_tracking());
    assert!(!h.controller.is_tracking());
    assert!(eventually(|| h.geo.active_watches() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clearing_driver_disables_force_create() {
    let h = harness();
    let feed = ManualAvailabilityFeed::new();
    feed.set("D1", DriverAvailability::Online);
    h.controller.attach(&feed);
    assert!(h.controller.wait_for_state(TrackingState::Tracking, WAIT).await);

    feed.clear();
    assert!(eventually(|| h.controller.driver().is_none()).await);
    assert!(!h.controller.is_tracking());
    assert!(!h.controller.force_create_location_record().await);
}
