//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Continuous location tracking session."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use dloc_logging::{track_debug, track_info, track_warn, LogContext};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::adapters::{AddressResolver, RecordStore};
use crate::controller::TrackingSnapshot;
use crate::metrics::TrackingMetrics;
use crate::model::{Coordinate, DriverId, LocationPatch, Position};
use crate::reconciler::StoreCallPolicy;

/// Collaborators a session task writes through.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub store: Arc<dyn RecordStore>,
    pub policy: StoreCallPolicy,
    pub metrics: Option<TrackingMetrics>,
    pub resolver: Option<Arc<dyn AddressResolver>>,
    pub address_refresh: Duration,
    pub snapshot: Arc<watch::Sender<TrackingSnapshot>>,
}

/// A live position subscription for one driver. Dropping it ends the subscription.
pub struct TrackingSession {
    id: u64,
    driver: DriverId,
    handle: JoinHandle<()>,
    metrics: Option<TrackingMetrics>,
}

impl TrackingSession {
    pub(crate) fn spawn(
        id: u64,
        driver: DriverId,
        positions: mpsc::Receiver<Coordinate>,
        context: SessionContext,
    ) -> Self {
        let metrics = context.metrics.clone();
        if let Some(metrics) = &metrics {
            metrics.session_opened();
        }
        let handle = tokio::spawn(run_session(id, driver.clone(), positions, context));
        Self {
            id,
            driver,
            handle,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> &DriverId {
        &self.driver
    }

    /// Whether the position stream ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the session task, closing the position subscription.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(metrics) = &self.metrics {
            metrics.session_closed();
        }
    }
}

impl std::fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .finish()
    }
}

async fn run_session(
    id: u64,
    driver: DriverId,
    mut positions: mpsc::Receiver<Coordinate>,
    context: SessionContext,
) {
    let ctx = LogContext::new()
        .with_driver(driver.as_str())
        .with_session(id)
        .with_state("tracking");
    track_info!(context = ctx, "location tracking session started");

    let store = context.store.as_ref();
    let mut last_resolved: Option<Instant> = None;

    while let Some(coordinate) = positions.recv().await {
        let position = Position::now(coordinate);
        context.snapshot.send_modify(|snapshot| {
            if snapshot.session_id == Some(id) {
                snapshot.current_location = Some(position);
            }
        });

        let patch = LocationPatch::from_coordinate(&coordinate, position.captured_at);
        let written = context
            .policy
            .run("update", context.metrics.as_ref(), || {
                store.update(&driver, &patch)
            })
            .await;
        if let Some(metrics) = &context.metrics {
            metrics.record_position_update(written.is_ok());
        }
        match written {
            Ok(_) => track_debug!(
                context = ctx,
                "position {}, {} written",
                coordinate.latitude,
                coordinate.longitude
            ),
            Err(err) => track_warn!(context = ctx, "position update failed: {err}"),
        }

        let Some(resolver) = &context.resolver else {
            continue;
        };
        if last_resolved.is_some_and(|at| at.elapsed() < context.address_refresh) {
            continue;
        }
        last_resolved = Some(Instant::now());
        match resolver.reverse_geocode(&coordinate).await {
            Ok(Some(address)) => context.snapshot.send_modify(|snapshot| {
                if snapshot.session_id == Some(id) {
                    snapshot.current_address = Some(address);
                }
            }),
            Ok(None) => {}
            Err(err) => track_warn!(context = ctx, "reverse geocoding failed: {err}"),
        }
    }

    track_warn!(context = ctx, "position stream closed by source");
}
