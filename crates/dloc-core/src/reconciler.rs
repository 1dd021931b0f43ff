//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Location record reconciliation protocol."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Guarantees that a driver has exactly one fresh location record.
//!
//! A reconciliation runs four steps in order while holding the driver's lock:
//! lookup, coordinate acquisition, idempotent write and read-back
//! verification. Only a failure of both write paths fails the operation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use chrono::Utc;
use dloc_common::config::{AccuracyLevel, FallbackCoordinate, StoreConfig, TrackingConfig};
use dloc_common::time::{duration_to_millis, with_jitter};
use dloc_logging::{
    log_lifecycle_event, track_debug, track_error, track_info, track_warn, LifecycleOutcome,
    LogContext,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{sleep, timeout};

use crate::adapters::{GeolocationSource, RecordStore};
use crate::error::{StoreError, TrackingError};
use crate::metrics::TrackingMetrics;
use crate::model::{Coordinate, DriverId, LocationPatch, LocationRecord};

/// Timeout and bounded retry applied to every record store call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreCallPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first one, for transport failures only.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Maximum random spread added to each retry delay.
    pub jitter: Duration,
}

impl StoreCallPolicy {
    pub fn new(timeout: Duration, retries: u32, retry_delay: Duration, jitter: Duration) -> Self {
        Self {
            timeout,
            retries,
            retry_delay,
            jitter,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.timeout,
            config.retries,
            config.retry_delay,
            config.retry_jitter,
        )
    }

    fn retry_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.retry_delay;
        }
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        with_jitter(self.retry_delay, self.jitter, sample)
    }

    /// Run `call` under the timeout, repeating retryable failures up to `retries` times.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        metrics: Option<&TrackingMetrics>,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.timeout)),
            };
            match result {
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.retry_delay();
                    track_warn!(
                        "store {operation} failed ({err}); retry {attempt}/{} in {}ms",
                        self.retries,
                        duration_to_millis(delay)
                    );
                    if let Some(metrics) = metrics {
                        metrics.record_store_retry(operation);
                    }
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

impl Default for StoreCallPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Tracking options the reconciler needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    pub fallback: FallbackCoordinate,
    pub accuracy: AccuracyLevel,
    pub acquisition_timeout: Duration,
    pub pin_to_fallback: bool,
}

impl ReconcilerConfig {
    pub fn new(fallback: FallbackCoordinate) -> Self {
        let defaults = TrackingConfig::default();
        Self {
            fallback,
            accuracy: defaults.accuracy,
            acquisition_timeout: defaults.acquisition_timeout,
            pin_to_fallback: false,
        }
    }

    /// Fails when no fallback coordinate is configured.
    pub fn from_tracking(config: &TrackingConfig) -> AnyResult<Self> {
        Ok(Self {
            fallback: config.fallback()?,
            accuracy: config.accuracy,
            acquisition_timeout: config.acquisition_timeout,
            pin_to_fallback: config.pin_to_fallback,
        })
    }

    pub fn with_acquisition_timeout(mut self, bound: Duration) -> Self {
        self.acquisition_timeout = bound;
        self
    }

    pub fn pinned(mut self, pin: bool) -> Self {
        self.pin_to_fallback = pin;
        self
    }
}

/// Where the written coordinate came from.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionSource {
    Sensor,
    /// The sensor failed; the configured fallback was used.
    Fallback(TrackingError),
    /// The sensor answered but the coordinate was pinned to the fallback.
    Pinned,
}

impl AcquisitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionSource::Sensor => "sensor",
            AcquisitionSource::Fallback(_) => "fallback",
            AcquisitionSource::Pinned => "pinned",
        }
    }
}

/// Which write succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePath {
    Upsert,
    /// Upsert failed with the carried error; a plain update succeeded.
    UpdateFallback(TrackingError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Verified,
    Warning(TrackingError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Fast path: a record already existed, nothing was written.
    AlreadyPresent(LocationRecord),
    Written {
        record: LocationRecord,
        acquisition: AcquisitionSource,
        path: WritePath,
        verification: Verification,
    },
    Failed {
        upsert: TrackingError,
        update: TrackingError,
    },
}

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub driver: DriverId,
    pub outcome: ReconcileOutcome,
    /// Step-one lookup failure that was absorbed.
    pub lookup_error: Option<TrackingError>,
    pub elapsed: Duration,
}

impl ReconcileReport {
    /// Whether tracking may begin.
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, ReconcileOutcome::Failed { .. })
    }

    /// Succeeded, but at least one step fell back or warned.
    pub fn is_degraded(&self) -> bool {
        match &self.outcome {
            ReconcileOutcome::AlreadyPresent(_) => false,
            ReconcileOutcome::Written {
                acquisition,
                path,
                verification,
                ..
            } => {
                self.lookup_error.is_some()
                    || matches!(acquisition, AcquisitionSource::Fallback(_))
                    || matches!(path, WritePath::UpdateFallback(_))
                    || matches!(verification, Verification::Warning(_))
            }
            ReconcileOutcome::Failed { .. } => false,
        }
    }

    pub fn record(&self) -> Option<&LocationRecord> {
        match &self.outcome {
            ReconcileOutcome::AlreadyPresent(record) => Some(record),
            ReconcileOutcome::Written { record, .. } => Some(record),
            ReconcileOutcome::Failed { .. } => None,
        }
    }

    /// Metric label: `present`, `written`, `degraded` or `failed`.
    pub fn label(&self) -> &'static str {
        match &self.outcome {
            ReconcileOutcome::AlreadyPresent(_) => "present",
            ReconcileOutcome::Failed { .. } => "failed",
            ReconcileOutcome::Written { .. } if self.is_degraded() => "degraded",
            ReconcileOutcome::Written { .. } => "written",
        }
    }
}

/// One async lock per driver, pruned once nobody holds or waits on it.
#[derive(Debug, Default)]
struct DriverLocks {
    locks: Mutex<HashMap<DriverId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DriverLocks {
    fn lock_for(&self, driver: &DriverId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(driver.clone()).or_default().clone()
    }
}

/// Runs the reconciliation protocol against a record store and a geolocation source.
pub struct RecordReconciler {
    store: Arc<dyn RecordStore>,
    geo: Arc<dyn GeolocationSource>,
    config: ReconcilerConfig,
    policy: StoreCallPolicy,
    metrics: Option<TrackingMetrics>,
    locks: DriverLocks,
}

impl RecordReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        geo: Arc<dyn GeolocationSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            geo,
            config,
            policy: StoreCallPolicy::default(),
            metrics: None,
            locks: DriverLocks::default(),
        }
    }

    pub fn with_policy(mut self, policy: StoreCallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn policy(&self) -> StoreCallPolicy {
        self.policy
    }

    pub async fn reconcile(&self, driver: &DriverId) -> ReconcileReport {
        let started = Instant::now();
        let lock = self.locks.lock_for(driver);
        let _guard = lock.lock().await;

        let ctx = LogContext::new().with_driver(driver.as_str());
        let mut lookup_error = None;

        match self.find(driver).await {
            Ok(Some(record)) => {
                track_info!(
                    context = ctx,
                    "location record already present at {}, {}",
                    record.latitude,
                    record.longitude
                );
                return self.finish(
                    driver,
                    ReconcileOutcome::AlreadyPresent(record),
                    None,
                    started,
                );
            }
            Ok(None) => {}
            Err(err) => {
                track_warn!(context = ctx, "record lookup failed, continuing: {err}");
                lookup_error = Some(TrackingError::from(err));
            }
        }

        let (coordinate, acquisition) = self.acquire(&ctx).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_acquisition(acquisition.as_str());
        }
        let record = LocationRecord::from_coordinate(driver.clone(), &coordinate, Utc::now());

        let (record, path) = match self.write(&ctx, &record).await {
            Ok(written) => written,
            Err((upsert, update)) => {
                track_error!(
                    context = ctx,
                    "location record write failed: upsert {upsert}, update {update}"
                );
                let outcome = ReconcileOutcome::Failed { upsert, update };
                return self.finish(driver, outcome, lookup_error, started);
            }
        };

        let verification = self.verify(&ctx, &record).await;
        let outcome = ReconcileOutcome::Written {
            record,
            acquisition,
            path,
            verification,
        };
        self.finish(driver, outcome, lookup_error, started)
    }

    async fn find(&self, driver: &DriverId) -> Result<Option<LocationRecord>, StoreError> {
        let store = self.store.as_ref();
        self.policy
            .run("find", self.metrics.as_ref(), || store.find(driver))
            .await
    }

    async fn acquire(&self, ctx: &LogContext<'_>) -> (Coordinate, AcquisitionSource) {
        let bound = self.config.acquisition_timeout;
        let fallback = Coordinate::from(self.config.fallback);
        let reading = match timeout(bound, self.geo.current_position(self.config.accuracy, bound))
            .await
        {
            Ok(Ok(coordinate)) => Ok(coordinate),
            Ok(Err(err)) => Err(TrackingError::from(err)),
            Err(_) => Err(TrackingError::AcquisitionTimeout(bound)),
        };

        match reading {
            Ok(mut coordinate) => {
                if coordinate.accuracy.is_none() {
                    coordinate.accuracy = Some(self.config.fallback.accuracy);
                }
                if self.config.pin_to_fallback {
                    track_debug!(context = *ctx, "sensor fix replaced by pinned fallback");
                    coordinate.latitude = fallback.latitude;
                    coordinate.longitude = fallback.longitude;
                    return (coordinate, AcquisitionSource::Pinned);
                }
                (coordinate, AcquisitionSource::Sensor)
            }
            Err(err) => {
                track_warn!(
                    context = *ctx,
                    "position acquisition failed ({err}); using fallback {}, {}",
                    fallback.latitude,
                    fallback.longitude
                );
                (fallback, AcquisitionSource::Fallback(err))
            }
        }
    }

    async fn write(
        &self,
        ctx: &LogContext<'_>,
        record: &LocationRecord,
    ) -> Result<(LocationRecord, WritePath), (TrackingError, TrackingError)> {
        let store = self.store.as_ref();
        let metrics = self.metrics.as_ref();

        let upsert = self
            .policy
            .run("upsert", metrics, || store.upsert(record))
            .await;
        if let Some(metrics) = metrics {
            metrics.record_write("upsert", upsert.is_ok());
        }
        let upsert_err = match upsert {
            Ok(written) => return Ok((written, WritePath::Upsert)),
            Err(err) => TrackingError::from(err),
        };
        track_warn!(context = *ctx, "upsert failed ({upsert_err}); attempting update");

        let patch: LocationPatch = record.patch();
        let update = self
            .policy
            .run("update", metrics, || store.update(&record.driver_id, &patch))
            .await;
        if let Some(metrics) = metrics {
            metrics.record_write("update", update.is_ok());
        }
        match update {
            Ok(written) => Ok((written, WritePath::UpdateFallback(upsert_err))),
            Err(err) => Err((upsert_err, TrackingError::from(err))),
        }
    }

    async fn verify(&self, ctx: &LogContext<'_>, written: &LocationRecord) -> Verification {
        let driver = &written.driver_id;
        let verification = match self.find(driver).await {
            Ok(Some(stored)) if stored.same_position_as(written) => Verification::Verified,
            Ok(Some(stored)) => Verification::Warning(TrackingError::VerificationMismatch {
                driver: driver.clone(),
                detail: format!(
                    "stored {}, {} differs from written {}, {}",
                    stored.latitude, stored.longitude, written.latitude, written.longitude
                ),
            }),
            Ok(None) => Verification::Warning(TrackingError::VerificationMismatch {
                driver: driver.clone(),
                detail: "no record found after write".into(),
            }),
            Err(err) => Verification::Warning(TrackingError::from(err)),
        };
        if let Verification::Warning(err) = &verification {
            track_warn!(context = *ctx, "record verification: {err}");
        }
        if let Some(metrics) = &self.metrics {
            let result = match &verification {
                Verification::Verified => "verified",
                Verification::Warning(TrackingError::VerificationMismatch { .. }) => "mismatch",
                Verification::Warning(_) => "unreadable",
            };
            metrics.record_verification(result);
        }
        verification
    }

    fn finish(
        &self,
        driver: &DriverId,
        outcome: ReconcileOutcome,
        lookup_error: Option<TrackingError>,
        started: Instant,
    ) -> ReconcileReport {
        let report = ReconcileReport {
            driver: driver.clone(),
            outcome,
            lookup_error,
            elapsed: started.elapsed(),
        };
        let lifecycle = if !report.succeeded() {
            LifecycleOutcome::Fault
        } else if report.is_degraded() {
            LifecycleOutcome::Degraded
        } else {
            LifecycleOutcome::Success
        };
        let ctx = LogContext::new().with_driver(driver.as_str());
        log_lifecycle_event(
            Some(&ctx),
            "reconcile",
            &format!(
                "reconciliation {} in {}ms",
                report.label(),
                duration_to_millis(report.elapsed)
            ),
            lifecycle,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_reconciliation(report.label(), report.elapsed);
        }
        report
    }
}
