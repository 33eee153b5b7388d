//! In-process store backend.
//!
//! All data sits behind one mutex, which makes [`StateStore::commit_cycle`]
//! atomic: readers observe either the whole cycle or none of it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ke_common::{Anomaly, Forecast, Innovation, MetricKey, MetricState, RegistrySnapshot};

use crate::error::{StoreError, StoreResult};
use crate::store::{tail, CycleCommit, MetricRecord, RetentionPolicy, StateStore};

#[derive(Debug, Default)]
struct Inner {
    metrics: HashMap<MetricKey, MetricRecord>,
    registry: RegistrySnapshot,
}

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retention: RetentionPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &MetricKey) -> StoreResult<Option<MetricState>> {
        let inner = self.lock()?;
        Ok(inner.metrics.get(key).and_then(|r| r.current.clone()))
    }

    fn save(&self, key: &MetricKey, state: &MetricState) -> StoreResult<()> {
        let retention = self.retention;
        let mut inner = self.lock()?;
        let record = inner.metrics.entry(key.clone()).or_default();
        record.apply_save(state, retention);
        Ok(())
    }

    fn append_innovation(&self, key: &MetricKey, innovation: &Innovation) -> StoreResult<()> {
        let retention = self.retention;
        let mut inner = self.lock()?;
        let record = inner.metrics.entry(key.clone()).or_default();
        record.apply_innovation(innovation, retention);
        Ok(())
    }

    fn read_innovations(&self, key: &MetricKey, window: usize) -> StoreResult<Vec<Innovation>> {
        let inner = self.lock()?;
        Ok(inner
            .metrics
            .get(key)
            .map(|r| tail(&r.innovations, window))
            .unwrap_or_default())
    }

    fn snapshots(&self, key: &MetricKey, limit: usize) -> StoreResult<Vec<MetricState>> {
        let inner = self.lock()?;
        Ok(inner
            .metrics
            .get(key)
            .map(|r| tail(&r.snapshots, limit))
            .unwrap_or_default())
    }

    fn save_forecasts(&self, key: &MetricKey, forecasts: &[Forecast]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.metrics.entry(key.clone()).or_default().forecasts = forecasts.to_vec();
        Ok(())
    }

    fn load_forecasts(&self, key: &MetricKey) -> StoreResult<Vec<Forecast>> {
        let inner = self.lock()?;
        Ok(inner
            .metrics
            .get(key)
            .map(|r| r.forecasts.clone())
            .unwrap_or_default())
    }

    fn append_anomalies(&self, key: &MetricKey, anomalies: &[Anomaly]) -> StoreResult<()> {
        let retention = self.retention;
        let mut inner = self.lock()?;
        let record = inner.metrics.entry(key.clone()).or_default();
        record.apply_anomalies(anomalies, retention);
        Ok(())
    }

    fn read_anomalies(&self, key: &MetricKey) -> StoreResult<Vec<Anomaly>> {
        let inner = self.lock()?;
        Ok(inner
            .metrics
            .get(key)
            .map(|r| r.anomalies.clone())
            .unwrap_or_default())
    }

    fn update_anomaly(&self, key: &MetricKey, anomaly: &Anomaly) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .metrics
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("anomaly {}", anomaly.id)))?
            .replace_anomaly(anomaly)
    }

    fn load_registry(&self) -> StoreResult<RegistrySnapshot> {
        Ok(self.lock()?.registry.clone())
    }

    fn save_registry(&self, registry: &RegistrySnapshot) -> StoreResult<()> {
        self.lock()?.registry = registry.clone();
        Ok(())
    }

    fn commit_cycle(&self, key: &MetricKey, commit: &CycleCommit) -> StoreResult<()> {
        let retention = self.retention;
        let mut inner = self.lock()?;
        let record = inner.metrics.entry(key.clone()).or_default();
        // Stage on a copy so the swap below is the only mutation.
        *record = record.staged(commit, retention);
        Ok(())
    }
}
