//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Shared primitives and utilities for the tracking runtime."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
//! Shared primitives for the DLOC workspace: configuration loading, tracing
//! initialisation, and small time helpers consumed across crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AccuracyLevel, AppConfig, FallbackCoordinate, LoadedAppConfig, LoggingConfig, MetricsConfig,
    Platform, RoutePoint, SimulatorConfig, StoreBackend, StoreConfig, TrackingConfig,
    WatchConfig, DEFAULT_ACCURACY_METERS,
};
pub use logging::{init_tracing, LogFormat};
