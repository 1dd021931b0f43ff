//! ---
//! dloc_section: "03-persistence-logging"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Structured logging adapters and sinks."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured logging context shared by the tracking crates.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

#[macro_use]
pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Driver identity associated with the log event.
    pub driver: Option<&'a str>,
    /// Tracking session sequence number, when one is live.
    pub session: Option<u64>,
    /// Lifecycle state name (`idle`, `awaiting_record`, `tracking`).
    pub state: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a driver identity.
    pub fn with_driver(mut self, driver: &'a str) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Attach a tracking session number.
    pub fn with_session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a lifecycle state name.
    pub fn with_state(mut self, state: &'a str) -> Self {
        self.state = Some(state);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed as intended.
    Success,
    /// The operation completed but a recoverable problem was absorbed.
    Degraded,
    /// The operation failed.
    Fault,
}

impl LifecycleOutcome {
    /// Stable label used in log fields and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Degraded => "degraded",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event with an outcome-derived level.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        LifecycleOutcome::Success => track_info!(
            context = ctx,
            "{event} [{}]: {message}",
            outcome.as_str()
        ),
        LifecycleOutcome::Degraded => track_warn!(
            context = ctx,
            "{event} [{}]: {message}",
            outcome.as_str()
        ),
        LifecycleOutcome::Fault => track_error!(
            context = ctx,
            "{event} [{}]: {message}",
            outcome.as_str()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new().with_driver("D1").with_state("idle");
        track_info!(context = ctx.clone(), "driver online");
        track_debug!("debug message");
        track_warn!(context = ctx.clone().with_session(3), "verification mismatch");
        track_error!(context = ctx, "write failed: {}", 42);
    }

    #[test]
    fn lifecycle_helper_emits_every_outcome() {
        init();
        let ctx = LogContext::new().with_driver("D1");
        for outcome in [
            LifecycleOutcome::Success,
            LifecycleOutcome::Degraded,
            LifecycleOutcome::Fault,
        ] {
            log_lifecycle_event(Some(&ctx), "reconcile", "test event", outcome);
        }
        log_lifecycle_event(None, "reconcile", "no context", LifecycleOutcome::Success);
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(LifecycleOutcome::Degraded.as_str(), "degraded");
        assert_eq!(LifecycleOutcome::Fault.as_str(), "fault");
    }
}
