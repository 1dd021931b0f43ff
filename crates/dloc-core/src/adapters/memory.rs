//! ---
//! dloc_section: "05-networking-external-interfaces"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "In-memory location record store with fault injection."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use super::RecordStore;
use crate::error::StoreError;
use crate::model::{DriverId, LocationPatch, LocationRecord};

/// Operation selector used for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Find,
    Upsert,
    Update,
}

/// Number of calls received per operation, including failed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub finds: usize,
    pub upserts: usize,
    pub updates: usize,
}

impl StoreCalls {
    /// Upserts plus updates.
    pub fn writes(&self) -> usize {
        self.upserts + self.updates
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: BTreeMap<DriverId, LocationRecord>,
    calls: StoreCalls,
    queued_faults: HashMap<StoreOp, VecDeque<StoreError>>,
    sticky_faults: HashMap<StoreOp, StoreError>,
    latency: Option<Duration>,
}

impl MemoryInner {
    fn enter(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::Find => self.calls.finds += 1,
            StoreOp::Upsert => self.calls.upserts += 1,
            StoreOp::Update => self.calls.updates += 1,
        }
        if let Some(err) = self
            .queued_faults
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        if let Some(err) = self.sticky_faults.get(&op) {
            return Err(err.clone());
        }
        Ok(())
    }
}

/// In-memory location table keyed by driver, so at most one row per driver exists.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing accounting.
    pub fn insert(&self, record: LocationRecord) {
        self.inner
            .lock()
            .rows
            .insert(record.driver_id.clone(), record);
    }

    /// Fail the next call of `op` with `error`. Queued faults are consumed in order.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.inner
            .lock()
            .queued_faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `op` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, op: StoreOp, error: StoreError) {
        self.inner.lock().sticky_faults.insert(op, error);
    }

    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.queued_faults.clear();
        inner.sticky_faults.clear();
    }

    /// Delay every call by `latency` before it is served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    pub fn get(&self, driver: &DriverId) -> Option<LocationRecord> {
        self.inner.lock().rows.get(driver).cloned()
    }

    pub fn rows(&self) -> Vec<LocationRecord> {
        self.inner.lock().rows.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> StoreCalls {
        self.inner.lock().calls
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find(&self, driver: &DriverId) -> Result<Option<LocationRecord>, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.enter(StoreOp::Find)?;
        Ok(inner.rows.get(driver).cloned())
    }

    async fn upsert(&self, record: &LocationRecord) -> Result<LocationRecord, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.enter(StoreOp::Upsert)?;
        inner
            .rows
            .insert(record.driver_id.clone(), record.clone());
        Ok(record.clone())
    }

    async fn update(
        &self,
        driver: &DriverId,
        patch: &LocationPatch,
    ) -> Result<LocationRecord, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.enter(StoreOp::Update)?;
        let row = inner
            .rows
            .get_mut(driver)
            .ok_or_else(|| StoreError::NotFound(driver.clone()))?;
        row.apply(patch);
        Ok(row.clone())
    }
}
