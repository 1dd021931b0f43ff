//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Daemon configuration model, loading and validation."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

/// Accuracy sentinel (meters) written when a reading carries no accuracy.
pub const DEFAULT_ACCURACY_METERS: f64 = 10.0;

fn default_platform() -> Platform {
    Platform::Native
}

fn default_accuracy_level() -> AccuracyLevel {
    AccuracyLevel::High
}

fn default_acquisition_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fallback_accuracy() -> f64 {
    DEFAULT_ACCURACY_METERS
}

fn default_watch_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_watch_distance() -> f64 {
    10.0
}

fn default_address_refresh() -> Duration {
    Duration::from_secs(30)
}

fn default_store_table() -> String {
    "live_locations".to_owned()
}

fn default_key_column() -> String {
    "user_id".to_owned()
}

fn default_api_key_env() -> String {
    "DLOC_STORE_API_KEY".to_owned()
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_store_retries() -> u32 {
    1
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_simulator_step() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9464))
}

/// Primary configuration object for the tracking daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "DLOC_CONFIG";

    /// Load configuration from disk, respecting the `DLOC_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.tracking.validate()?;
        self.store.validate()?;
        self.simulator.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Host platform the geolocation stack runs on.
///
/// Browser contexts grant location access implicitly, so permission checks
/// there always report `granted`.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Native,
    Web,
}

impl Platform {
    pub fn grants_implicitly(&self) -> bool {
        matches!(self, Platform::Web)
    }
}

/// Accuracy hint forwarded to the geolocation source.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyLevel {
    Lowest,
    Low,
    Balanced,
    #[default]
    High,
    Highest,
}

impl AccuracyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccuracyLevel::Lowest => "lowest",
            AccuracyLevel::Low => "low",
            AccuracyLevel::Balanced => "balanced",
            AccuracyLevel::High => "high",
            AccuracyLevel::Highest => "highest",
        }
    }
}

/// Coordinate written when the geolocation source cannot produce one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FallbackCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_fallback_accuracy")]
    pub accuracy: f64,
}

impl FallbackCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: default_fallback_accuracy(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(anyhow!(
                "fallback latitude {} outside [-90, 90]",
                self.latitude
            ));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(anyhow!(
                "fallback longitude {} outside [-180, 180]",
                self.longitude
            ));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(anyhow!("fallback accuracy must be a non-negative number"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default = "default_accuracy_level")]
    pub accuracy: AccuracyLevel,
    #[serde(default = "default_acquisition_timeout", rename = "acquisition_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub acquisition_timeout: Duration,
    /// Write the fallback coordinate even when the sensor answered.
    #[serde(default)]
    pub pin_to_fallback: bool,
    #[serde(default)]
    pub fallback: Option<FallbackCoordinate>,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            accuracy: default_accuracy_level(),
            acquisition_timeout: default_acquisition_timeout(),
            pin_to_fallback: false,
            fallback: None,
            watch: WatchConfig::default(),
        }
    }
}

impl TrackingConfig {
    /// Return the configured fallback coordinate or a descriptive error.
    pub fn fallback(&self) -> Result<FallbackCoordinate> {
        self.fallback
            .ok_or_else(|| anyhow!("tracking.fallback must be configured"))
    }

    pub fn validate(&self) -> Result<()> {
        self.fallback()?.validate()?;
        if self.acquisition_timeout.is_zero() {
            return Err(anyhow!("tracking.acquisition_timeout_ms must be positive"));
        }
        self.watch.validate()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_interval", rename = "interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_watch_distance")]
    pub distance_m: f64,
    #[serde(default = "default_address_refresh", rename = "address_refresh_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub address_refresh: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: default_watch_interval(),
            distance_m: default_watch_distance(),
            address_refresh: default_address_refresh(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("tracking.watch.interval_ms must be positive"));
        }
        if !self.distance_m.is_finite() || self.distance_m < 0.0 {
            return Err(anyhow!("tracking.watch.distance_m must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgrest,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgrest => "postgrest",
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_store_table")]
    pub table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Name of the environment variable holding the service key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_store_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_store_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay", rename = "retry_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    #[serde(default = "default_retry_jitter", rename = "retry_jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_jitter: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            table: default_store_table(),
            key_column: default_key_column(),
            api_key_env: default_api_key_env(),
            timeout: default_store_timeout(),
            retries: default_store_retries(),
            retry_delay: default_retry_delay(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

impl StoreConfig {
    /// Parse the configured base URL.
    pub fn base_url(&self) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("store.url is required for the postgrest backend"))?;
        let url = Url::parse(raw).with_context(|| format!("invalid store.url '{raw}'"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("store.url must use http or https, got '{}'", url.scheme()));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("store.timeout_ms must be positive"));
        }
        if self.table.trim().is_empty() {
            return Err(anyhow!("store.table must not be empty"));
        }
        if self.key_column.trim().is_empty() {
            return Err(anyhow!("store.key_column must not be empty"));
        }
        if matches!(self.backend, StoreBackend::Postgrest) {
            self.base_url()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Scripted geolocation and permission behaviour for hosts without a sensor.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub route: Vec<RoutePoint>,
    #[serde(default = "default_simulator_step", rename = "step_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub step_interval: Duration,
    /// Make one-shot acquisition fail so the fallback coordinate is exercised.
    #[serde(default)]
    pub fail_acquisition: bool,
    #[serde(default = "default_true")]
    pub grant_permission: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            route: Vec::new(),
            step_interval: default_simulator_step(),
            fail_acquisition: false,
            grant_permission: true,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_interval.is_zero() {
            return Err(anyhow!("simulator.step_interval_ms must be positive"));
        }
        for (index, point) in self.route.iter().enumerate() {
            if !(-90.0..=90.0).contains(&point.latitude)
                || !(-180.0..=180.0).contains(&point.longitude)
            {
                return Err(anyhow!("simulator.route[{index}] is not a valid coordinate"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
