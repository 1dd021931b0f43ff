//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Error taxonomy for reconciliation and tracking."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

use crate::model::DriverId;

/// Result alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;

/// Failures reported by a [`RecordStore`](crate::adapters::RecordStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The uniqueness constraint on the driver key rejected the write.
    #[error("unique constraint rejected write for driver {driver}: {detail}")]
    Constraint { driver: DriverId, detail: String },
    /// An update targeted a driver without a record.
    #[error("no location record for driver {0}")]
    NotFound(DriverId),
    /// Network or backend failure.
    #[error("record store transport failure: {0}")]
    Transport(String),
    /// The call did not complete within the configured bound.
    #[error("record store call exceeded {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Only transport-level failures are worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Timeout(_))
    }
}

/// Failures reported by a [`GeolocationSource`](crate::adapters::GeolocationSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeoError {
    #[error("no position fix within {0:?}")]
    Timeout(Duration),
    #[error("location permission denied: {0}")]
    PermissionDenied(String),
    #[error("location services unavailable: {0}")]
    Unavailable(String),
}

/// Error taxonomy surfaced by the reconciler and the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("position acquisition failed: {0}")]
    AcquisitionFailed(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("no record to update for driver {0}")]
    RecordMissing(DriverId),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("verification mismatch for driver {driver}: {detail}")]
    VerificationMismatch { driver: DriverId, detail: String },
    #[error("no active driver")]
    NoActiveDriver,
    #[error("position subscription failed: {0}")]
    SubscriptionFailed(String),
}

impl TrackingError {
    /// Stable label for log fields and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackingError::PermissionDenied => "permission_denied",
            TrackingError::AcquisitionTimeout(_) => "acquisition_timeout",
            TrackingError::AcquisitionFailed(_) => "acquisition_failed",
            TrackingError::ConstraintViolation(_) => "constraint_violation",
            TrackingError::RecordMissing(_) => "record_missing",
            TrackingError::TransportFailure(_) => "transport_failure",
            TrackingError::VerificationMismatch { .. } => "verification_mismatch",
            TrackingError::NoActiveDriver => "no_active_driver",
            TrackingError::SubscriptionFailed(_) => "subscription_failed",
        }
    }
}

impl From<StoreError> for TrackingError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Constraint { detail, .. } => TrackingError::ConstraintViolation(detail),
            StoreError::NotFound(driver) => TrackingError::RecordMissing(driver),
            StoreError::Transport(detail) => TrackingError::TransportFailure(detail),
            StoreError::Timeout(bound) => {
                TrackingError::TransportFailure(format!("timed out after {bound:?}"))
            }
        }
    }
}

impl From<GeoError> for TrackingError {
    fn from(value: GeoError) -> Self {
        match value {
            GeoError::Timeout(bound) => TrackingError::AcquisitionTimeout(bound),
            GeoError::PermissionDenied(_) => TrackingError::PermissionDenied,
            GeoError::Unavailable(detail) => TrackingError::AcquisitionFailed(detail),
        }
    }
}
