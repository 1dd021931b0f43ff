//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Location permission gate."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::sync::Arc;

use dloc_common::config::Platform;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::adapters::PermissionSource;
use crate::model::{PermissionState, PermissionStatus};

/// Wraps the platform permission API. Never fails: errors read as `denied`.
pub struct PermissionGate {
    source: Arc<dyn PermissionSource>,
    platform: Platform,
    state: Mutex<PermissionState>,
}

impl PermissionGate {
    pub fn new(source: Arc<dyn PermissionSource>, platform: Platform) -> Self {
        Self {
            source,
            platform,
            state: Mutex::new(PermissionState::Unknown),
        }
    }

    /// Query the current grant without prompting.
    pub async fn check(&self) -> PermissionState {
        if self.platform.grants_implicitly() {
            return self.store(PermissionState::Granted);
        }
        let state = match self.source.status().await {
            Ok(status) => PermissionState::from(status),
            Err(err) => {
                warn!(error = %err, "permission status query failed");
                PermissionState::Denied
            }
        };
        debug!(?state, "permission checked");
        self.store(state)
    }

    /// Prompt when not already granted. Returns whether location access is usable.
    pub async fn request(&self) -> bool {
        if self.platform.grants_implicitly() {
            self.store(PermissionState::Granted);
            return true;
        }
        if self.state().is_granted() {
            return true;
        }
        let state = match self.source.request_access().await {
            Ok(PermissionStatus::Granted) => PermissionState::Granted,
            Ok(status) => {
                debug!(?status, "location permission refused");
                PermissionState::Denied
            }
            Err(err) => {
                warn!(error = %err, "permission request failed");
                PermissionState::Denied
            }
        };
        self.store(state).is_granted()
    }

    /// Last observed state, without I/O.
    pub fn state(&self) -> PermissionState {
        *self.state.lock()
    }

    fn store(&self, state: PermissionState) -> PermissionState {
        *self.state.lock() = state;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticPermissionSource;

    #[tokio::test]
    async fn web_platform_is_granted_without_asking() {
        let source = Arc::new(StaticPermissionSource::denied());
        let gate = PermissionGate::new(source.clone(), Platform::Web);
        assert_eq!(gate.check().await, PermissionState::Granted);
        assert!(gate.request().await);
        assert_eq!(source.prompts(), 0);
    }

    #[tokio::test]
    async fn request_is_idempotent_once_granted() {
        let source = Arc::new(StaticPermissionSource::prompting(PermissionStatus::Granted));
        let gate = PermissionGate::new(source.clone(), Platform::Native);
        assert_eq!(gate.check().await, PermissionState::Unknown);
        assert!(gate.request().await);
        assert!(gate.request().await);
        assert_eq!(source.prompts(), 1);
        assert_eq!(gate.state(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn source_failures_read_as_denied() {
        let source = Arc::new(StaticPermissionSource::granted());
        source.set_failing(true);
        let gate = PermissionGate::new(source, Platform::Native);
        assert_eq!(gate.check().await, PermissionState::Denied);
        assert!(!gate.request().await);
    }

    #[tokio::test]
    async fn refusal_is_reported() {
        let source = Arc::new(StaticPermissionSource::prompting(PermissionStatus::Denied));
        let gate = PermissionGate::new(source, Platform::Native);
        assert!(!gate.request().await);
        assert_eq!(gate.state(), PermissionState::Denied);
    }
}
