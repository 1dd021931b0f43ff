//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Location record reconciliation and tracking lifecycle."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Core of the driver location service: makes sure an active driver has a
//! location record, then keeps it fresh through a continuous subscription.

pub mod adapters;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod model;
pub mod permission;
pub mod reconciler;
pub mod session;

pub use controller::{
    Activation, ActivationOutcome, TrackingController, TrackingControllerBuilder,
    TrackingSnapshot, TrackingState, Transition,
};
pub use error::{GeoError, Result, StoreError, TrackingError};
pub use metrics::TrackingMetrics;
pub use model::{
    Coordinate, DriverAvailability, DriverId, DriverStatus, LocationPatch, LocationRecord,
    PermissionState, PermissionStatus, Position,
};
pub use permission::PermissionGate;
pub use reconciler::{
    AcquisitionSource, ReconcileOutcome, ReconcileReport, ReconcilerConfig, RecordReconciler,
    StoreCallPolicy, Verification, WritePath,
};
pub use session::TrackingSession;
