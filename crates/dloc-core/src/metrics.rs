//! ---
//! dloc_section: "03-persistence-logging"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Metrics published by the tracking core."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use dloc_metrics::SharedRegistry;
use prometheus::{self, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts};

/// Metrics published by the reconciler and the lifecycle controller.
#[derive(Clone)]
pub struct TrackingMetrics {
    registry: SharedRegistry,
    reconciliations_total: IntCounterVec,
    reconcile_seconds: Histogram,
    record_writes_total: IntCounterVec,
    acquisitions_total: IntCounterVec,
    verifications_total: IntCounterVec,
    store_retries_total: IntCounterVec,
    position_updates_total: IntCounterVec,
    active_sessions: IntGauge,
}

impl TrackingMetrics {
    /// Register the tracking metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "dloc_reconciliations_total",
                "Record reconciliations by outcome (present, written, degraded, failed)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "dloc_reconcile_duration_seconds",
                "Wall-clock duration of one reconciliation",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 14)?),
        )?;
        registry.register(Box::new(reconcile_seconds.clone()))?;

        let record_writes_total = IntCounterVec::new(
            Opts::new(
                "dloc_record_writes_total",
                "Record store writes issued during reconciliation",
            ),
            &["path", "result"],
        )?;
        registry.register(Box::new(record_writes_total.clone()))?;

        let acquisitions_total = IntCounterVec::new(
            Opts::new(
                "dloc_position_acquisitions_total",
                "Coordinates used for record creation by source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(acquisitions_total.clone()))?;

        let verifications_total = IntCounterVec::new(
            Opts::new(
                "dloc_record_verifications_total",
                "Read-back verification results after a write",
            ),
            &["result"],
        )?;
        registry.register(Box::new(verifications_total.clone()))?;

        let store_retries_total = IntCounterVec::new(
            Opts::new(
                "dloc_store_retries_total",
                "Record store calls repeated after a transport failure",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_retries_total.clone()))?;

        let position_updates_total = IntCounterVec::new(
            Opts::new(
                "dloc_position_updates_total",
                "Continuous tracking fixes written to the record store",
            ),
            &["result"],
        )?;
        registry.register(Box::new(position_updates_total.clone()))?;

        let active_sessions = IntGauge::with_opts(Opts::new(
            "dloc_tracking_sessions_active",
            "Continuous tracking sessions currently open",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_seconds,
            record_writes_total,
            acquisitions_total,
            verifications_total,
            store_retries_total,
            position_updates_total,
            active_sessions,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_reconciliation(&self, outcome: &str, elapsed: Duration) {
        self.reconciliations_total
            .with_label_values(&[outcome])
            .inc();
        self.reconcile_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_write(&self, path: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.record_writes_total
            .with_label_values(&[path, result])
            .inc();
    }

    pub fn record_acquisition(&self, source: &str) {
        self.acquisitions_total.with_label_values(&[source]).inc();
    }

    pub fn record_verification(&self, result: &str) {
        self.verifications_total.with_label_values(&[result]).inc();
    }

    pub fn record_store_retry(&self, operation: &str) {
        self.store_retries_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_position_update(&self, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.position_updates_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn reconciliations(&self, outcome: &str) -> u64 {
        self.reconciliations_total
            .with_label_values(&[outcome])
            .get()
    }

    pub fn position_updates(&self, success: bool) -> u64 {
        let result = if success { "ok" } else { "error" };
        self.position_updates_total
            .with_label_values(&[result])
            .get()
    }
}
