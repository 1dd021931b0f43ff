//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Collaborator interfaces and their adapters."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Interfaces to the external collaborators consumed by the tracking core,
//! together with in-memory, simulated, and PostgREST-backed implementations.

use std::time::Duration;

use async_trait::async_trait;
use dloc_common::config::{AccuracyLevel, TrackingConfig};
use tokio::sync::{mpsc, watch};

use crate::error::{GeoError, StoreError};
use crate::model::{
    Coordinate, DriverId, DriverStatus, LocationPatch, LocationRecord, PermissionStatus,
};

pub mod feed;
pub mod memory;
pub mod permission;
pub mod postgrest;
pub mod simulated;

/// Buffer size of position watch channels handed out by geolocation sources.
pub const POSITION_CHANNEL_CAPACITY: usize = 16;

/// Remote table holding one location record per driver.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup by driver identity.
    async fn find(&self, driver: &DriverId) -> Result<Option<LocationRecord>, StoreError>;

    /// Insert or merge the record, using the driver identity as the conflict key.
    async fn upsert(&self, record: &LocationRecord) -> Result<LocationRecord, StoreError>;

    /// Overwrite the non-key fields of an existing record.
    async fn update(
        &self,
        driver: &DriverId,
        patch: &LocationPatch,
    ) -> Result<LocationRecord, StoreError>;
}

/// Options forwarded when opening a continuous position watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub accuracy: AccuracyLevel,
    /// Minimum time between fixes.
    pub interval: Duration,
    /// Minimum displacement in meters between fixes.
    pub distance_m: f64,
}

impl WatchOptions {
    pub fn from_config(config: &TrackingConfig) -> Self {
        Self {
            accuracy: config.accuracy,
            interval: config.watch.interval,
            distance_m: config.watch.distance_m,
        }
    }
}

/// Device sensor or web-platform geolocation provider.
#[async_trait]
pub trait GeolocationSource: Send + Sync {
    /// Obtain one fix, giving up after `timeout`.
    async fn current_position(
        &self,
        accuracy: AccuracyLevel,
        timeout: Duration,
    ) -> Result<Coordinate, GeoError>;

    /// Open a continuous watch. Dropping the receiver ends the watch.
    async fn watch_position(
        &self,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<Coordinate>, GeoError>;
}

/// Platform permission API.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Current grant, without prompting.
    async fn status(&self) -> anyhow::Result<PermissionStatus>;

    /// Prompt the user for access.
    async fn request_access(&self) -> anyhow::Result<PermissionStatus>;
}

/// Reverse geocoder used to label the current location.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn reverse_geocode(&self, coordinate: &Coordinate) -> anyhow::Result<Option<String>>;
}

/// Push-based source of the signed-in driver's availability. `None` means no driver.
pub trait AvailabilityFeed: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Option<DriverStatus>>;
}

pub use feed::ManualAvailabilityFeed;
pub use memory::{MemoryRecordStore, StoreCalls, StoreOp};
pub use permission::StaticPermissionSource;
pub use postgrest::{PostgrestConfig, PostgrestRecordStore};
pub use simulated::{CoordinateLabelResolver, SimulatedGeolocation};
