//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Domain model for driver location records."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use dloc_common::config::{FallbackCoordinate, DEFAULT_ACCURACY_METERS};
use serde::{Deserialize, Serialize};

/// Opaque driver identity; the unique key of a location record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DriverId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Availability reported for a driver by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverAvailability {
    #[default]
    Unknown,
    Offline,
    Online,
    Busy,
}

impl DriverAvailability {
    /// Only `online` and `busy` drivers are tracked.
    pub fn is_active(&self) -> bool {
        matches!(self, DriverAvailability::Online | DriverAvailability::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverAvailability::Unknown => "unknown",
            DriverAvailability::Offline => "offline",
            DriverAvailability::Online => "online",
            DriverAvailability::Busy => "busy",
        }
    }
}

impl std::str::FromStr for DriverAvailability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(DriverAvailability::Unknown),
            "offline" => Ok(DriverAvailability::Offline),
            "online" => Ok(DriverAvailability::Online),
            "busy" => Ok(DriverAvailability::Busy),
            other => Err(format!("unknown availability: {}", other)),
        }
    }
}

/// One value of the availability feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub driver_id: DriverId,
    pub availability: DriverAvailability,
}

impl DriverStatus {
    pub fn new(driver_id: impl Into<DriverId>, availability: DriverAvailability) -> Self {
        Self {
            driver_id: driver_id.into(),
            availability,
        }
    }

    pub fn is_active(&self) -> bool {
        self.availability.is_active()
    }
}

/// Reading produced by a geolocation source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            heading: None,
            speed: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_motion(mut self, heading: f64, speed: f64) -> Self {
        self.heading = Some(heading);
        self.speed = Some(speed);
        self
    }
}

impl From<FallbackCoordinate> for Coordinate {
    fn from(value: FallbackCoordinate) -> Self {
        Coordinate::new(value.latitude, value.longitude).with_accuracy(value.accuracy)
    }
}

/// Coordinate stamped with its capture time; the observable "current location".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coordinate: Coordinate,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn now(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            captured_at: Utc::now(),
        }
    }
}

/// A driver's last known position as persisted in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

impl LocationRecord {
    /// Build a record from a reading, substituting the accuracy sentinel when absent.
    pub fn from_coordinate(
        driver_id: DriverId,
        coordinate: &Coordinate,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            driver_id,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            heading: coordinate.heading,
            speed: coordinate.speed,
            accuracy: coordinate.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS),
            updated_at,
        }
    }

    /// The non-key fields, as written by a plain update.
    pub fn patch(&self) -> LocationPatch {
        LocationPatch {
            latitude: self.latitude,
            longitude: self.longitude,
            heading: self.heading,
            speed: self.speed,
            accuracy: self.accuracy,
            updated_at: self.updated_at,
        }
    }

    /// Apply a patch in place, keeping the key.
    pub fn apply(&mut self, patch: &LocationPatch) {
        self.latitude = patch.latitude;
        self.longitude = patch.longitude;
        self.heading = patch.heading;
        self.speed = patch.speed;
        self.accuracy = patch.accuracy;
        self.updated_at = patch.updated_at;
    }

    /// Whether the persisted coordinate matches `other`'s.
    pub fn same_position_as(&self, other: &LocationRecord) -> bool {
        const EPSILON: f64 = 1e-9;
        (self.latitude - other.latitude).abs() < EPSILON
            && (self.longitude - other.longitude).abs() < EPSILON
    }
}

/// Partial field set written by `update`; everything except the driver key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPatch {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

impl LocationPatch {
    pub fn from_coordinate(coordinate: &Coordinate, updated_at: DateTime<Utc>) -> Self {
        Self {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            heading: coordinate.heading,
            speed: coordinate.speed,
            accuracy: coordinate.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS),
            updated_at,
        }
    }
}

/// Permission state tracked by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionState::Granted)
    }
}

/// Raw answer from the platform permission API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

impl From<PermissionStatus> for PermissionState {
    fn from(value: PermissionStatus) -> Self {
        match value {
            PermissionStatus::Granted => PermissionState::Granted,
            PermissionStatus::Denied => PermissionState::Denied,
            PermissionStatus::Undetermined => PermissionState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_online_and_busy_are_active() {
        assert!(DriverAvailability::Online.is_active());
        assert!(DriverAvailability::Busy.is_active());
        assert!(!DriverAvailability::Offline.is_active());
        assert!(!DriverAvailability::Unknown.is_active());
    }

    #[test]
    fn availability_parses_case_insensitively() {
        assert_eq!("BUSY".parse::<DriverAvailability>(), Ok(DriverAvailability::Busy));
        assert!("parked".parse::<DriverAvailability>().is_err());
    }

    #[test]
    fn record_substitutes_accuracy_sentinel() {
        let record = LocationRecord::from_coordinate(
            DriverId::from("D1"),
            &Coordinate::new(1.0, 2.0),
            Utc::now(),
        );
        assert_eq!(record.accuracy, DEFAULT_ACCURACY_METERS);
        assert_eq!(record.heading, None);
    }

    #[test]
    fn patch_roundtrips_non_key_fields() {
        let now = Utc::now();
        let mut record = LocationRecord::from_coordinate(
            DriverId::from("D1"),
            &Coordinate::new(1.0, 2.0),
            now,
        );
        let patch = LocationPatch::from_coordinate(
            &Coordinate::new(3.0, 4.0).with_motion(90.0, 12.5),
            now,
        );
        record.apply(&patch);
        assert_eq!(record.driver_id.as_str(), "D1");
        assert_eq!(record.patch(), patch);
    }

    #[test]
    fn undetermined_maps_to_unknown() {
        assert_eq!(
            PermissionState::from(PermissionStatus::Undetermined),
            PermissionState::Unknown
        );
    }
}
