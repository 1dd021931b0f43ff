//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Manually driven availability feed."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use tokio::sync::watch;

use super::AvailabilityFeed;
use crate::model::{DriverAvailability, DriverId, DriverStatus};

/// Availability feed driven by explicit `publish` calls (host glue, CLI, tests).
#[derive(Debug)]
pub struct ManualAvailabilityFeed {
    sender: watch::Sender<Option<DriverStatus>>,
}

impl Default for ManualAvailabilityFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualAvailabilityFeed {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Replace the current value; subscribers observe every distinct publish.
    pub fn publish(&self, status: Option<DriverStatus>) {
        self.sender.send_replace(status);
    }

    pub fn set(&self, driver: impl Into<DriverId>, availability: DriverAvailability) {
        self.publish(Some(DriverStatus::new(driver, availability)));
    }

    /// Signal that no driver is signed in.
    pub fn clear(&self) {
        self.publish(None);
    }

    pub fn current(&self) -> Option<DriverStatus> {
        self.sender.borrow().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl AvailabilityFeed for ManualAvailabilityFeed {
    fn subscribe(&self) -> watch::Receiver<Option<DriverStatus>> {
        self.sender.subscribe()
    }
}
