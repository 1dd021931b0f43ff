//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Reconciler behaviour against in-memory and scripted stores."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dloc_common::config::FallbackCoordinate;
use dloc_core::adapters::{MemoryRecordStore, RecordStore, SimulatedGeolocation, StoreOp};
use dloc_core::{
    AcquisitionSource, Coordinate, DriverId, GeoError, LocationPatch, LocationRecord,
    ReconcileOutcome, ReconcileReport, ReconcilerConfig, RecordReconciler, StoreCallPolicy,
    StoreError, TrackingError, TrackingMetrics, Verification, WritePath,
};
use dloc_metrics::new_registry;

const FALLBACK_LAT: f64 = 12.7401984;
const FALLBACK_LNG: f64 = 77.824;

fn fast_policy() -> StoreCallPolicy {
    StoreCallPolicy::new(
        Duration::from_secs(1),
        1,
        Duration::from_millis(1),
        Duration::ZERO,
    )
}

fn reconciler(store: &MemoryRecordStore, geo: &SimulatedGeolocation) -> RecordReconciler {
    RecordReconciler::new(
        Arc::new(store.clone()),
        Arc::new(geo.clone()),
        ReconcilerConfig::new(FallbackCoordinate::new(FALLBACK_LAT, FALLBACK_LNG))
            .with_acquisition_timeout(Duration::from_millis(50)),
    )
    .with_policy(fast_policy())
}

/// Accepts every write but reports `read_back` once a write happened.
struct ReadBackStore {
    written: AtomicBool,
    read_back: Option<Coordinate>,
}

impl ReadBackStore {
    fn new(read_back: Option<Coordinate>) -> Self {
        Self {
            written: AtomicBool::new(false),
            read_back,
        }
    }
}

#[async_trait]
impl RecordStore for ReadBackStore {
    async fn find(&self, driver: &DriverId) -> Result<Option<LocationRecord>, StoreError> {
        if !self.written.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.read_back.map(|coordinate| {
            LocationRecord::from_coordinate(driver.clone(), &coordinate, Utc::now())
        }))
    }

    async fn upsert(&self, record: &LocationRecord) -> Result<LocationRecord, StoreError> {
        self.written.store(true, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn update(
        &self,
        driver: &DriverId,
        _patch: &LocationPatch,
    ) -> Result<LocationRecord, StoreError> {
        Err(StoreError::NotFound(driver.clone()))
    }
}

async fn reconcile_with_read_back(read_back: Option<Coordinate>) -> ReconcileReport {
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0).with_accuracy(5.0));
    RecordReconciler::new(
        Arc::new(ReadBackStore::new(read_back)),
        Arc::new(geo),
        ReconcilerConfig::new(FallbackCoordinate::new(FALLBACK_LAT, FALLBACK_LNG)),
    )
    .with_policy(fast_policy())
    .reconcile(&DriverId::from("D1"))
    .await
}

fn seeded(driver: &str, latitude: f64, longitude: f64) -> LocationRecord {
    LocationRecord::from_coordinate(
        DriverId::from(driver),
        &Coordinate::new(latitude, longitude),
        Utc::now(),
    )
}

#[tokio::test]
async fn second_reconcile_takes_fast_path() {
    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::fixed(Coordinate::new(12.9, 77.6).with_accuracy(5.0));
    let reconciler = reconciler(&store, &geo);
    let driver = DriverId::from("D1");

    let first = reconciler.reconcile(&driver).await;
    assert!(first.succeeded());
    assert_eq!(first.label(), "written");

    let second = reconciler.reconcile(&driver).await;
    assert!(second.succeeded());
    assert!(matches!(second.outcome, ReconcileOutcome::AlreadyPresent(_)));

    assert_eq!(store.len(), 1);
    assert_eq!(store.calls().upserts, 1);
    assert_eq!(geo.acquisitions(), 1);
}

#[tokio::test]
async fn existing_record_is_left_untouched() {
    let store = MemoryRecordStore::new();
    let existing = seeded("D2", 1.0, 2.0);
    store.insert(existing.clone());
    let geo = SimulatedGeolocation::fixed(Coordinate::new(9.0, 9.0));

    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D2")).await;

    assert!(report.succeeded());
    assert_eq!(report.record(), Some(&existing));
    assert_eq!(store.calls().writes(), 0);
    assert_eq!(geo.acquisitions(), 0);
}

#[tokio::test(start_paused = true)]
async fn acquisition_timeout_writes_fallback() {
    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::fixed(Coordinate::new(48.1, 11.5));
    geo.set_reply_delay(Some(Duration::from_secs(30)));

    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D1")).await;

    assert!(report.succeeded());
    assert!(report.is_degraded());
    let row = store.get(&DriverId::from("D1")).unwrap();
    assert_eq!((row.latitude, row.longitude), (FALLBACK_LAT, FALLBACK_LNG));
    assert_eq!(row.accuracy, 10.0);
    assert!(matches!(
        report.outcome,
        ReconcileOutcome::Written {
            acquisition: AcquisitionSource::Fallback(TrackingError::AcquisitionTimeout(_)),
            ..
        }
    ));
}

#[tokio::test]
async fn unavailable_sensor_writes_fallback() {
    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::failing(GeoError::Unavailable("gps off".into()));

    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D1")).await;

    let record = report.record().unwrap();
    assert_eq!((record.latitude, record.longitude), (FALLBACK_LAT, FALLBACK_LNG));
}

#[tokio::test]
async fn constraint_violation_falls_back_to_update() {
    let store = MemoryRecordStore::new();
    store.insert(seeded("D1", 0.0, 0.0));
    // the lookup misses the existing row, so the write path runs
    store.fail_next(StoreOp::Find, StoreError::Transport("row filter".into()));
    store.fail_next(StoreOp::Find, StoreError::Transport("row filter".into()));
    store.fail_next(
        StoreOp::Upsert,
        StoreError::Constraint {
            driver: DriverId::from("D1"),
            detail: "duplicate key value violates unique constraint".into(),
        },
    );
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));

    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D1")).await;

    assert!(report.succeeded());
    assert!(matches!(
        report.outcome,
        ReconcileOutcome::Written {
            path: WritePath::UpdateFallback(TrackingError::ConstraintViolation(_)),
            ..
        }
    ));
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&DriverId::from("D1")).unwrap().latitude, 3.0);
    assert_eq!(store.calls().updates, 1);
}

#[tokio::test]
async fn both_write_paths_failing_fails_reconcile() {
    let store = MemoryRecordStore::new();
    store.fail_always(StoreOp::Upsert, StoreError::Transport("connection reset".into()));
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));
    let metrics = TrackingMetrics::new(new_registry()).unwrap();

    let report = reconciler(&store, &geo)
        .with_metrics(Some(metrics.clone()))
        .reconcile(&DriverId::from("D1"))
        .await;

    assert!(!report.succeeded());
    assert_eq!(report.record(), None);
    match report.outcome {
        ReconcileOutcome::Failed { upsert, update } => {
            assert_eq!(upsert.kind(), "transport_failure");
            assert_eq!(update, TrackingError::RecordMissing(DriverId::from("D1")));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(store.calls().upserts, 2);
    assert!(store.is_empty());
    assert_eq!(metrics.reconciliations("failed"), 1);
}

#[tokio::test]
async fn transient_store_timeout_is_retried_once() {
    let store = MemoryRecordStore::new();
    store.fail_next(StoreOp::Upsert, StoreError::Timeout(Duration::from_secs(5)));
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));

    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D1")).await;

    assert!(report.succeeded());
    assert!(matches!(
        report.outcome,
        ReconcileOutcome::Written {
            path: WritePath::Upsert,
            ..
        }
    ));
    assert_eq!(store.calls().upserts, 2);
    assert_eq!(store.calls().updates, 0);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_store_fails_within_policy_bound() {
    let store = MemoryRecordStore::new();
    store.set_latency(Some(Duration::from_secs(60)));
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));

    let started = tokio::time::Instant::now();
    let report = reconciler(&store, &geo).reconcile(&DriverId::from("D1")).await;

    assert!(!report.succeeded());
    assert!(report.lookup_error.is_some());
    // find, upsert and update each get two bounded attempts
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_write_once() {
    let store = MemoryRecordStore::new();
    store.set_latency(Some(Duration::from_millis(20)));
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));
    let reconciler = Arc::new(reconciler(&store, &geo));
    let driver = DriverId::from("D1");

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = reconciler.clone();
            let driver = driver.clone();
            tokio::spawn(async move { reconciler.reconcile(&driver).await })
        })
        .collect();

    let mut fast_paths = 0;
    for task in tasks {
        let report = task.await.unwrap();
        assert!(report.succeeded());
        if matches!(report.outcome, ReconcileOutcome::AlreadyPresent(_)) {
            fast_paths += 1;
        }
    }

    assert_eq!(fast_paths, 3);
    assert_eq!(store.calls().writes(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn distinct_drivers_reconcile_independently() {
    let store = MemoryRecordStore::new();
    let geo = SimulatedGeolocation::fixed(Coordinate::new(3.0, 4.0));
    let reconciler = reconciler(&store, &geo);

    let (d1, d2) = (DriverId::from("D1"), DriverId::from("D2"));

    let (a, b) = tokio::join!(reconciler.reconcile(&d1), reconciler.reconcile(&d2));

    assert!(a.succeeded() && b.succeeded());
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn missing_record_after_write_only_warns() {
    let report = reconcile_with_read_back(None).await;

    assert!(report.succeeded());
    assert_eq!(report.label(), "degraded");
    match report.outcome {
        ReconcileOutcome::Written {
            acquisition: AcquisitionSource::Sensor,
            verification: Verification::Warning(TrackingError::VerificationMismatch { detail, .. }),
            ..
        } => assert_eq!(detail, "no record found after write"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn differing_stored_coordinate_only_warns() {
    let report = reconcile_with_read_back(Some(Coordinate::new(5.0, 6.0))).await;

    assert!(report.succeeded());
    assert_eq!(report.label(), "degraded");
    assert_eq!(report.record().map(|record| record.latitude), Some(3.0));
    match report.outcome {
        ReconcileOutcome::Written {
            verification: Verification::Warning(TrackingError::VerificationMismatch { detail, .. }),
            ..
        } => assert!(detail.contains("differs from written")),
        other => panic!("unexpected outcome {other:?}"),
    }
}
