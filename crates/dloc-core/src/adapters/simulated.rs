//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Simulated geolocation source and coordinate labels."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dloc_common::config::{AccuracyLevel, SimulatorConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::debug;

use super::{AddressResolver, GeolocationSource, WatchOptions, POSITION_CHANNEL_CAPACITY};
use crate::error::GeoError;
use crate::model::Coordinate;

#[derive(Debug)]
struct SimInner {
    replies: VecDeque<Result<Coordinate, GeoError>>,
    default_reply: Result<Coordinate, GeoError>,
    reply_delay: Option<Duration>,
    route: Vec<Coordinate>,
    step: Duration,
    watch_error: Option<GeoError>,
    watchers: Vec<mpsc::Sender<Coordinate>>,
    acquisitions: usize,
    watches_opened: usize,
    last_options: Option<WatchOptions>,
}

/// Scripted geolocation source for hosts without a sensor and for tests.
///
/// One-shot requests consume queued replies first and then fall back to the
/// default reply. Watches replay the configured route in a loop; an empty route
/// produces fixes only through [`emit`](Self::emit).
#[derive(Debug, Clone)]
pub struct SimulatedGeolocation {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedGeolocation {
    fn with_default(default_reply: Result<Coordinate, GeoError>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                replies: VecDeque::new(),
                default_reply,
                reply_delay: None,
                route: Vec::new(),
                step: Duration::from_secs(1),
                watch_error: None,
                watchers: Vec::new(),
                acquisitions: 0,
                watches_opened: 0,
                last_options: None,
            })),
        }
    }

    /// Always answer with `coordinate`.
    pub fn fixed(coordinate: Coordinate) -> Self {
        Self::with_default(Ok(coordinate))
    }

    /// Always fail one-shot requests with `error`.
    pub fn failing(error: GeoError) -> Self {
        Self::with_default(Err(error))
    }

    /// Build from the daemon's simulator section.
    pub fn from_config(config: &SimulatorConfig) -> Self {
        let route: Vec<Coordinate> = config
            .route
            .iter()
            .map(|point| Coordinate::new(point.latitude, point.longitude))
            .collect();
        let sim = match (config.fail_acquisition, route.first()) {
            (false, Some(first)) => Self::fixed(*first),
            _ => Self::failing(GeoError::Unavailable("simulated sensor offline".into())),
        };
        sim.set_route(route, config.step_interval);
        sim
    }

    pub fn push_reply(&self, reply: Result<Coordinate, GeoError>) {
        self.inner.lock().replies.push_back(reply);
    }

    /// Delay one-shot replies; a delay beyond the caller's timeout yields `GeoError::Timeout`.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.inner.lock().reply_delay = delay;
    }

    pub fn set_route(&self, route: Vec<Coordinate>, step: Duration) {
        let mut inner = self.inner.lock();
        inner.route = route;
        inner.step = step;
    }

    /// Make subsequent `watch_position` calls fail.
    pub fn fail_watch(&self, error: Option<GeoError>) {
        self.inner.lock().watch_error = error;
    }

    /// Push a fix to every open watch. Returns how many watches received it.
    pub fn emit(&self, coordinate: Coordinate) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|tx| !tx.is_closed());
        inner
            .watchers
            .iter()
            .filter(|tx| tx.try_send(coordinate).is_ok())
            .count()
    }

    pub fn acquisitions(&self) -> usize {
        self.inner.lock().acquisitions
    }

    pub fn watches_opened(&self) -> usize {
        self.inner.lock().watches_opened
    }

    /// Watches whose receiver is still alive.
    pub fn active_watches(&self) -> usize {
        self.inner
            .lock()
            .watchers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        self.inner.lock().last_options
    }
}

#[async_trait]
impl GeolocationSource for SimulatedGeolocation {
    async fn current_position(
        &self,
        accuracy: AccuracyLevel,
        timeout: Duration,
    ) -> Result<Coordinate, GeoError> {
        let (reply, delay) = {
            let mut inner = self.inner.lock();
            inner.acquisitions += 1;
            let reply = inner
                .replies
                .pop_front()
                .unwrap_or_else(|| inner.default_reply.clone());
            (reply, inner.reply_delay)
        };
        debug!(accuracy = accuracy.as_str(), ?delay, "simulated acquisition");
        if let Some(delay) = delay {
            if delay > timeout {
                sleep(timeout).await;
                return Err(GeoError::Timeout(timeout));
            }
            sleep(delay).await;
        }
        reply
    }

    async fn watch_position(
        &self,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<Coordinate>, GeoError> {
        let (tx, rx) = mpsc::channel(POSITION_CHANNEL_CAPACITY);
        let (route, step) = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.watch_error.clone() {
                return Err(err);
            }
            inner.watches_opened += 1;
            inner.last_options = Some(options);
            inner.watchers.retain(|tx| !tx.is_closed());
            inner.watchers.push(tx.clone());
            (inner.route.clone(), inner.step)
        };

        if !route.is_empty() {
            tokio::spawn(async move {
                let mut ticker = interval(step);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                for point in route.iter().cycle() {
                    ticker.tick().await;
                    if tx.send(*point).await.is_err() {
                        break;
                    }
                }
                debug!("simulated watch closed");
            });
        }
        Ok(rx)
    }
}

/// Labels a coordinate with its rounded decimal degrees.
#[derive(Debug, Clone, Default)]
pub struct CoordinateLabelResolver;

#[async_trait]
impl AddressResolver for CoordinateLabelResolver {
    async fn reverse_geocode(&self, coordinate: &Coordinate) -> anyhow::Result<Option<String>> {
        Ok(Some(format!(
            "{:.5}, {:.5}",
            coordinate.latitude, coordinate.longitude
        )))
    }
}
