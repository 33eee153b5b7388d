//! JSON file store backend.
//!
//! # Storage Structure
//!
//! ```text
//! <root>/
//! ├── registry.json                 # Source registry + pending reviews
//! └── <tenant>/
//!     └── <metric>.json             # State, snapshots, innovations,
//!                                   # forecasts and anomalies of one metric
//! ```
//!
//! Each document is written to a temporary sibling and renamed into place.
//! A metric lives in exactly one document, so a cycle commit is a single
//! rename and a failed write leaves the previous cycle intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use ke_common::{Anomaly, Forecast, Innovation, MetricKey, MetricState, RegistrySnapshot};

use crate::error::{StoreError, StoreResult};
use crate::store::{tail, CycleCommit, MetricRecord, RetentionPolicy, StateStore};

const DATA_DIR_NAME: &str = "kalman_estimate";
const REGISTRY_FILE: &str = "registry.json";

/// Get the default store directory.
pub fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Store backed by a directory tree of JSON documents.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metric_path(&self, key: &MetricKey) -> PathBuf {
        self.root
            .join(key.tenant.as_str())
            .join(format!("{}.json", key.metric.as_str()))
    }

    fn read_record(&self, key: &MetricKey) -> StoreResult<MetricRecord> {
        let record: MetricRecord = self.read_json(&self.metric_path(key))?.unwrap_or_default();
        if let Some(s) = &record.current {
            if s.tenant != key.tenant || s.metric != key.metric {
                return Err(StoreError::Corrupted(format!(
                    "record for {key} belongs to {}/{}",
                    s.tenant, s.metric
                )));
            }
        }
        Ok(record)
    }

    /// Read, modify and rewrite one metric document.
    fn modify_record(
        &self,
        key: &MetricKey,
        f: impl FnOnce(&mut MetricRecord) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut record = self.read_record(key)?;
        f(&mut record)?;
        self.write_json(&self.metric_path(key), &record)
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Corrupted(format!("{}: {e}", path.display()))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(value)?;

        let tmp_path = path.with_extension("json.tmp");
        let written = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, path));
        if let Err(e) = written {
            // Best effort; the previous document is still in place.
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        trace!(path = %path.display(), bytes = json.len(), "store file written");
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, key: &MetricKey) -> StoreResult<Option<MetricState>> {
        Ok(self.read_record(key)?.current)
    }

    fn save(&self, key: &MetricKey, state: &MetricState) -> StoreResult<()> {
        let retention = self.retention;
        self.modify_record(key, |record| {
            record.apply_save(state, retention);
            Ok(())
        })?;
        debug!(
            %key,
            cycle = state.cycle,
            model_version = state.model_version,
            "state saved"
        );
        Ok(())
    }

    fn append_innovation(&self, key: &MetricKey, innovation: &Innovation) -> StoreResult<()> {
        let retention = self.retention;
        self.modify_record(key, |record| {
            record.apply_innovation(innovation, retention);
            Ok(())
        })
    }

    fn read_innovations(&self, key: &MetricKey, window: usize) -> StoreResult<Vec<Innovation>> {
        Ok(tail(&self.read_record(key)?.innovations, window))
    }

    fn snapshots(&self, key: &MetricKey, limit: usize) -> StoreResult<Vec<MetricState>> {
        Ok(tail(&self.read_record(key)?.snapshots, limit))
    }

    fn save_forecasts(&self, key: &MetricKey, forecasts: &[Forecast]) -> StoreResult<()> {
        self.modify_record(key, |record| {
            record.forecasts = forecasts.to_vec();
            Ok(())
        })
    }

    fn load_forecasts(&self, key: &MetricKey) -> StoreResult<Vec<Forecast>> {
        Ok(self.read_record(key)?.forecasts)
    }

    fn append_anomalies(&self, key: &MetricKey, anomalies: &[Anomaly]) -> StoreResult<()> {
        let retention = self.retention;
        self.modify_record(key, |record| {
            record.apply_anomalies(anomalies, retention);
            Ok(())
        })
    }

    fn read_anomalies(&self, key: &MetricKey) -> StoreResult<Vec<Anomaly>> {
        Ok(self.read_record(key)?.anomalies)
    }

    fn update_anomaly(&self, key: &MetricKey, anomaly: &Anomaly) -> StoreResult<()> {
        self.modify_record(key, |record| record.replace_anomaly(anomaly))
    }

    fn load_registry(&self) -> StoreResult<RegistrySnapshot> {
        Ok(self
            .read_json(&self.root.join(REGISTRY_FILE))?
            .unwrap_or_default())
    }

    fn save_registry(&self, registry: &RegistrySnapshot) -> StoreResult<()> {
        self.write_json(&self.root.join(REGISTRY_FILE), registry)
    }

    fn commit_cycle(&self, key: &MetricKey, commit: &CycleCommit) -> StoreResult<()> {
        let staged = self.read_record(key)?.staged(commit, self.retention);
        self.write_json(&self.metric_path(key), &staged)?;
        debug!(
            %key,
            cycle = commit.state.cycle,
            anomalies = commit.anomalies.len(),
            forecasts = commit.forecasts.len(),
            "cycle committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use tempfile::tempdir;

    fn commit(cycle: u64, horizon: u32) -> CycleCommit {
        CycleCommit {
            state: state(cycle, 1),
            innovation: Some(innovation(cycle, 4.2)),
            anomalies: vec![anomaly(cycle)],
            forecasts: (1..=horizon).map(forecast).collect(),
        }
    }

    #[test]
    fn test_layout_on_disk() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&key(), &state(0, 1)).unwrap();
        let tenant_dir = dir.path().join("acme");
        assert!(tenant_dir.join("mrr.json").is_file());
        assert!(!tenant_dir.join("mrr.json.tmp").exists());
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = tempdir().unwrap();
        JsonFileStore::new(dir.path())
            .save(&key(), &state(4, 2))
            .unwrap();
        let loaded = JsonFileStore::new(dir.path()).load(&key()).unwrap().unwrap();
        assert_eq!(loaded.cycle, 4);
        assert_eq!(loaded.model_version, 2);
    }

    #[test]
    fn test_commit_cycle_round_trip() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.commit_cycle(&key(), &commit(1, 2)).unwrap();
        store.commit_cycle(&key(), &commit(1, 2)).unwrap();

        assert_eq!(store.read_innovations(&key(), 10).unwrap().len(), 1);
        assert_eq!(store.read_anomalies(&key()).unwrap().len(), 1);
        assert_eq!(store.load_forecasts(&key()).unwrap().len(), 2);
        assert_eq!(store.snapshots(&key(), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_commit_write_changes_nothing() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.commit_cycle(&key(), &commit(1, 5)).unwrap();

        // A directory squatting on the temp path makes the write fail.
        let blocker = dir.path().join("acme").join("mrr.json.tmp");
        fs::create_dir_all(&blocker).unwrap();
        assert!(matches!(
            store.commit_cycle(&key(), &commit(2, 30)),
            Err(StoreError::Io(_))
        ));

        assert_eq!(store.load(&key()).unwrap().unwrap().cycle, 1);
        assert_eq!(store.load_forecasts(&key()).unwrap().len(), 5);
        assert_eq!(store.read_anomalies(&key()).unwrap().len(), 1);
        assert_eq!(store.read_innovations(&key(), 10).unwrap().len(), 1);
        assert_eq!(store.snapshots(&key(), 10).unwrap().len(), 1);

        fs::remove_dir(&blocker).unwrap();
        store.commit_cycle(&key(), &commit(2, 30)).unwrap();
        assert_eq!(store.load(&key()).unwrap().unwrap().cycle, 2);
        assert_eq!(store.load_forecasts(&key()).unwrap().len(), 30);
    }

    #[test]
    fn test_retention_applies_on_disk() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).with_retention(RetentionPolicy {
            innovations: 2,
            snapshots: 2,
            anomalies: 2,
        });
        for cycle in 1..=4 {
            store.append_innovation(&key(), &innovation(cycle, 0.0)).unwrap();
            store.save(&key(), &state(cycle, 1)).unwrap();
        }
        let cycles: Vec<_> = store
            .read_innovations(&key(), 10)
            .unwrap()
            .iter()
            .map(|i| i.cycle)
            .collect();
        assert_eq!(cycles, vec![3, 4]);
        assert_eq!(store.snapshots(&key(), 10).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupted_state_is_reported() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let tenant_dir = dir.path().join("acme");
        fs::create_dir_all(&tenant_dir).unwrap();
        fs::write(tenant_dir.join("mrr.json"), "{ truncated").unwrap();
        assert!(matches!(store.load(&key()), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_registry_file() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_registry().unwrap().sources.is_empty());
        store.save_registry(&registry()).unwrap();
        assert!(dir.path().join(REGISTRY_FILE).is_file());
        assert_eq!(store.load_registry().unwrap(), registry());
    }

    #[test]
    fn test_resolve_anomaly_on_disk() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let a = anomaly(7);
        store.append_anomalies(&key(), std::slice::from_ref(&a)).unwrap();
        let mut resolved = a.clone();
        resolved.status = ke_common::AnomalyStatus::Resolved;
        store.update_anomaly(&key(), &resolved).unwrap();
        let stored = store.read_anomalies(&key()).unwrap();
        assert_eq!(stored[0].status, ke_common::AnomalyStatus::Resolved);
    }
}
