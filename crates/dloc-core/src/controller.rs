//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Tracking lifecycle controller."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Drives the `Idle -> AwaitingRecord -> Tracking` lifecycle from the signed-in
//! driver's availability.
//!
//! Availability changes are applied in arrival order. Deactivation takes
//! effect immediately; activation awaits a reconciliation on a spawned task and
//! carries a generation number, so an activation overtaken by a later change
//! finishes its write but never opens a subscription.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result as AnyResult;
use dloc_common::config::TrackingConfig;
use dloc_logging::{log_lifecycle_event, track_info, track_warn, LifecycleOutcome, LogContext};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::{
    AddressResolver, AvailabilityFeed, GeolocationSource, PermissionSource, RecordStore,
    WatchOptions,
};
use crate::error::{GeoError, Result, TrackingError};
use crate::metrics::TrackingMetrics;
use crate::model::{DriverAvailability, DriverId, DriverStatus, PermissionState, Position};
use crate::permission::PermissionGate;
use crate::reconciler::{ReconcileReport, ReconcilerConfig, RecordReconciler, StoreCallPolicy};
use crate::session::{SessionContext, TrackingSession};

/// Lifecycle states. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    Idle,
    AwaitingRecord,
    Tracking,
}

impl TrackingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingState::Idle => "idle",
            TrackingState::AwaitingRecord => "awaiting_record",
            TrackingState::Tracking => "tracking",
        }
    }
}

/// Observable controller state.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TrackingSnapshot {
    pub state: TrackingState,
    pub driver: Option<DriverId>,
    pub permission: PermissionState,
    pub current_location: Option<Position>,
    pub current_address: Option<String>,
    pub is_tracking: bool,
    pub session_id: Option<u64>,
}

/// How an activation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Tracking,
    /// Both record writes failed; the controller returned to idle.
    RecordFailed,
    /// The record exists but the subscription could not be opened.
    SessionFailed(TrackingError),
    /// A later availability change overtook this activation.
    Superseded,
    /// The activation task was cancelled.
    Aborted,
}

/// Handle on a dispatched activation.
#[derive(Debug)]
pub struct Activation {
    generation: u64,
    handle: JoinHandle<ActivationOutcome>,
}

impl Activation {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the activation to finish.
    pub async fn outcome(self) -> ActivationOutcome {
        self.handle.await.unwrap_or(ActivationOutcome::Aborted)
    }
}

/// Effect of one availability value.
#[derive(Debug)]
pub enum Transition {
    /// No state change was required.
    Unchanged,
    /// Any live session was torn down and the controller is idle.
    Deactivated,
    Activated(Activation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOpen {
    Opened,
    AlreadyLive,
    Superseded,
}

#[derive(Debug, Default)]
struct Slot {
    state: TrackingState,
    driver: Option<DriverId>,
    generation: u64,
    session: Option<TrackingSession>,
}

impl Slot {
    /// Stop any session and return to idle. Returns whether anything was torn down.
    fn teardown(&mut self) -> bool {
        let had_session = match self.session.take() {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        };
        let was_active = self.state != TrackingState::Idle;
        self.state = TrackingState::Idle;
        self.generation += 1;
        had_session || was_active
    }
}

struct ControllerInner {
    gate: PermissionGate,
    reconciler: RecordReconciler,
    geo: Arc<dyn GeolocationSource>,
    session_context: SessionContext,
    metrics: Option<TrackingMetrics>,
    watch_options: WatchOptions,
    snapshot: Arc<watch::Sender<TrackingSnapshot>>,
    slot: Mutex<Slot>,
    started: AtomicBool,
    next_session: AtomicU64,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`TrackingController`].
pub struct TrackingControllerBuilder {
    store: Arc<dyn RecordStore>,
    geo: Arc<dyn GeolocationSource>,
    permissions: Arc<dyn PermissionSource>,
    resolver: Option<Arc<dyn AddressResolver>>,
    metrics: Option<TrackingMetrics>,
    tracking: TrackingConfig,
    policy: StoreCallPolicy,
}

impl TrackingControllerBuilder {
    pub fn tracking_config(mut self, config: TrackingConfig) -> Self {
        self.tracking = config;
        self
    }

    pub fn store_policy(mut self, policy: StoreCallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn metrics(mut self, metrics: TrackingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fails when the tracking section has no fallback coordinate.
    pub fn build(self) -> AnyResult<TrackingController> {
        let reconciler_config = ReconcilerConfig::from_tracking(&self.tracking)?;
        let reconciler = RecordReconciler::new(self.store.clone(), self.geo.clone(), reconciler_config)
            .with_policy(self.policy)
            .with_metrics(self.metrics.clone());
        let snapshot = Arc::new(watch::channel(TrackingSnapshot::default()).0);
        let session_context = SessionContext {
            store: self.store,
            policy: self.policy,
            metrics: self.metrics.clone(),
            resolver: self.resolver,
            address_refresh: self.tracking.watch.address_refresh,
            snapshot: snapshot.clone(),
        };

        Ok(TrackingController {
            inner: Arc::new(ControllerInner {
                gate: PermissionGate::new(self.permissions, self.tracking.platform),
                reconciler,
                geo: self.geo,
                session_context,
                metrics: self.metrics,
                watch_options: WatchOptions::from_config(&self.tracking),
                snapshot,
                slot: Mutex::new(Slot::default()),
                started: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
                feed_task: Mutex::new(None),
            }),
        })
    }
}

/// Owns the driver's tracking lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TrackingController {
    inner: Arc<ControllerInner>,
}

impl TrackingController {
    pub fn builder(
        store: Arc<dyn RecordStore>,
        geo: Arc<dyn GeolocationSource>,
        permissions: Arc<dyn PermissionSource>,
    ) -> TrackingControllerBuilder {
        TrackingControllerBuilder {
            store,
            geo,
            permissions,
            resolver: None,
            metrics: None,
            tracking: TrackingConfig::default(),
            policy: StoreCallPolicy::default(),
        }
    }

    /// Evaluate the location permission. Runs once per controller.
    pub async fn start(&self) -> PermissionState {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return self.inner.gate.state();
        }
        let permission = self.inner.gate.check().await;
        self.publish_permission(permission);
        track_info!("tracking controller started, permission {permission:?}");
        permission
    }

    /// Apply one availability value. Must be called from within a Tokio runtime.
    pub fn apply_availability(&self, status: Option<DriverStatus>) -> Transition {
        let mut slot = self.inner.slot.lock();
        let transition = match status {
            None => {
                let torn_down = slot.teardown();
                slot.driver = None;
                if torn_down {
                    Transition::Deactivated
                } else {
                    Transition::Unchanged
                }
            }
            Some(status) => self.transition_for(&mut slot, status),
        };
        self.publish_slot(&slot);
        drop(slot);

        if let Transition::Deactivated = transition {
            track_info!("driver inactive, location tracking stopped");
        }
        transition
    }

    fn transition_for(&self, slot: &mut Slot, status: DriverStatus) -> Transition {
        let same_driver = slot.driver.as_ref() == Some(&status.driver_id);
        match status.availability {
            DriverAvailability::Offline => {
                slot.driver = Some(status.driver_id);
                if slot.teardown() {
                    Transition::Deactivated
                } else {
                    Transition::Unchanged
                }
            }
            DriverAvailability::Unknown if same_driver => Transition::Unchanged,
            DriverAvailability::Unknown => {
                let torn_down = slot.teardown();
                slot.driver = Some(status.driver_id);
                if torn_down {
                    Transition::Deactivated
                } else {
                    Transition::Unchanged
                }
            }
            DriverAvailability::Online | DriverAvailability::Busy => {
                if same_driver && slot.state != TrackingState::Idle {
                    return Transition::Unchanged;
                }
                if !same_driver {
                    slot.teardown();
                }
                slot.driver = Some(status.driver_id.clone());
                slot.state = TrackingState::AwaitingRecord;
                slot.generation += 1;
                let generation = slot.generation;

                let controller = self.clone();
                let driver = status.driver_id;
                let handle =
                    tokio::spawn(async move { controller.activate(driver, generation).await });
                Transition::Activated(Activation { generation, handle })
            }
        }
    }

    async fn activate(&self, driver: DriverId, generation: u64) -> ActivationOutcome {
        let ctx = LogContext::new()
            .with_driver(driver.as_str())
            .with_state(TrackingState::AwaitingRecord.as_str());
        track_info!(context = ctx, "driver active, ensuring location record");

        let report = self.inner.reconciler.reconcile(&driver).await;
        if !report.succeeded() {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation {
                return ActivationOutcome::Superseded;
            }
            slot.state = TrackingState::Idle;
            self.publish_slot(&slot);
            drop(slot);
            log_lifecycle_event(
                Some(&ctx),
                "activation",
                "location record unavailable, tracking not started",
                LifecycleOutcome::Fault,
            );
            return ActivationOutcome::RecordFailed;
        }

        if self.inner.slot.lock().generation != generation {
            track_info!(context = ctx, "activation superseded after reconciliation");
            return ActivationOutcome::Superseded;
        }

        match self.open_session(&driver, Some(generation)).await {
            Ok(SessionOpen::Superseded) => {
                track_info!(context = ctx, "activation superseded before subscription");
                ActivationOutcome::Superseded
            }
            Ok(_) => {
                log_lifecycle_event(
                    Some(&ctx),
                    "activation",
                    "driver tracked",
                    LifecycleOutcome::Success,
                );
                ActivationOutcome::Tracking
            }
            Err(err) => {
                let mut slot = self.inner.slot.lock();
                if slot.generation == generation && slot.session.is_none() {
                    slot.state = TrackingState::Idle;
                    self.publish_slot(&slot);
                }
                drop(slot);
                log_lifecycle_event(
                    Some(&ctx),
                    "activation",
                    &format!("record ready but tracking failed: {err}"),
                    LifecycleOutcome::Fault,
                );
                ActivationOutcome::SessionFailed(err)
            }
        }
    }

    /// Open the position subscription unless one is already live for `driver`.
    async fn open_session(
        &self,
        driver: &DriverId,
        generation: Option<u64>,
    ) -> Result<SessionOpen> {
        if self.live_session_for(driver) {
            return Ok(SessionOpen::AlreadyLive);
        }

        let granted = self.inner.gate.request().await;
        self.publish_permission(self.inner.gate.state());
        if !granted {
            return Err(TrackingError::PermissionDenied);
        }

        let positions = self
            .inner
            .geo
            .watch_position(self.inner.watch_options)
            .await
            .map_err(|err| match err {
                GeoError::PermissionDenied(_) => TrackingError::PermissionDenied,
                other => TrackingError::SubscriptionFailed(other.to_string()),
            })?;

        let mut slot = self.inner.slot.lock();
        let superseded = generation.is_some_and(|generation| slot.generation != generation)
            || slot.driver.as_ref() != Some(driver);
        if superseded {
            return Ok(SessionOpen::Superseded);
        }
        if slot.session.is_some() {
            return Ok(SessionOpen::AlreadyLive);
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        slot.session = Some(TrackingSession::spawn(
            id,
            driver.clone(),
            positions,
            self.inner.session_context.clone(),
        ));
        slot.state = TrackingState::Tracking;
        self.publish_slot(&slot);
        Ok(SessionOpen::Opened)
    }

    fn live_session_for(&self, driver: &DriverId) -> bool {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .is_some_and(|session| session.driver() == driver)
    }

    /// Prompt for location access when not already granted.
    pub async fn request_location_permission(&self) -> bool {
        let granted = self.inner.gate.request().await;
        self.publish_permission(self.inner.gate.state());
        granted
    }

    /// Open the continuous subscription for the current driver. Idempotent.
    pub async fn start_location_tracking(&self) -> Result<()> {
        let driver = self
            .inner
            .slot
            .lock()
            .driver
            .clone()
            .ok_or(TrackingError::NoActiveDriver)?;
        match self.open_session(&driver, None).await? {
            SessionOpen::Superseded => Err(TrackingError::NoActiveDriver),
            SessionOpen::Opened | SessionOpen::AlreadyLive => Ok(()),
        }
    }

    /// Abort the live session, if any. In-flight reconciliation continues.
    pub fn stop_location_tracking(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        let Some(session) = slot.session.take() else {
            track_info!("no live tracking session to stop");
            return false;
        };
        let id = session.id();
        session.stop();
        if slot.state == TrackingState::Tracking {
            slot.state = TrackingState::Idle;
        }
        self.publish_slot(&slot);
        drop(slot);
        track_info!("tracking session {id} stopped");
        true
    }

    /// Reconcile the current driver's record. `false` when no driver is present.
    pub async fn force_create_location_record(&self) -> bool {
        match self.reconcile_current().await {
            Some(report) => report.succeeded(),
            None => false,
        }
    }

    /// Reconcile the current driver's record and return the full report.
    pub async fn reconcile_current(&self) -> Option<ReconcileReport> {
        let driver = self.inner.slot.lock().driver.clone();
        let Some(driver) = driver else {
            track_warn!("no driver available for location record");
            return None;
        };
        Some(self.inner.reconciler.reconcile(&driver).await)
    }

    /// Follow `feed`, replacing any previous subscription. The current value is applied first.
    pub fn attach(&self, feed: &dyn AvailabilityFeed) {
        let mut updates = feed.subscribe();
        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let initial = updates.borrow_and_update().clone();
            match weak.upgrade() {
                Some(inner) => {
                    TrackingController { inner }.apply_availability(initial);
                }
                None => return,
            }
            while updates.changed().await.is_ok() {
                let status = updates.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                TrackingController { inner }.apply_availability(status);
            }
        });
        if let Some(previous) = self.inner.feed_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop following the availability feed. Returns whether a feed was attached.
    pub fn detach(&self) -> bool {
        match self.inner.feed_task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Detach the feed and tear down any session.
    pub fn dispose(&self) {
        self.detach();
        let mut slot = self.inner.slot.lock();
        slot.teardown();
        self.publish_slot(&slot);
        drop(slot);
        track_info!("tracking controller disposed");
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn state(&self) -> TrackingState {
        self.inner.slot.lock().state
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.slot.lock().session.is_some()
    }

    pub fn current_location(&self) -> Option<Position> {
        self.inner.snapshot.borrow().current_location
    }

    pub fn current_address(&self) -> Option<String> {
        self.inner.snapshot.borrow().current_address.clone()
    }

    pub fn permission(&self) -> PermissionState {
        self.inner.gate.state()
    }

    pub fn driver(&self) -> Option<DriverId> {
        self.inner.slot.lock().driver.clone()
    }

    pub fn metrics(&self) -> Option<&TrackingMetrics> {
        self.inner.metrics.as_ref()
    }

    /// Wait until the published state equals `state`, or `bound` elapses.
    pub async fn wait_for_state(&self, state: TrackingState, bound: Duration) -> bool {
        let mut updates = self.subscribe();
        let wait = updates.wait_for(|snapshot| snapshot.state == state);
        let reached = matches!(tokio::time::timeout(bound, wait).await, Ok(Ok(_)));
        reached
    }

    fn publish_slot(&self, slot: &Slot) {
        self.inner.snapshot.send_modify(|snapshot| {
            snapshot.state = slot.state;
            snapshot.driver = slot.driver.clone();
            snapshot.is_tracking = slot.session.is_some();
            snapshot.session_id = slot.session.as_ref().map(TrackingSession::id);
        });
    }

    fn publish_permission(&self, permission: PermissionState) {
        self.inner
            .snapshot
            .send_if_modified(|snapshot| {
                let changed = snapshot.permission != permission;
                snapshot.permission = permission;
                changed
            });
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(task) = self.feed_task.get_mut().take() {
            task.abort();
        }
    }
}
