//! The store adapter contract.

use ke_common::{Anomaly, Forecast, Innovation, MetricKey, MetricState, RegistrySnapshot};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// How much history a backend keeps per metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub innovations: usize,
    pub snapshots: usize,
    pub anomalies: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            innovations: 365,
            snapshots: 100,
            anomalies: 500,
        }
    }
}

/// Everything one estimation cycle persists.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub state: MetricState,
    pub innovation: Option<Innovation>,
    pub anomalies: Vec<Anomaly>,
    /// Replaces the previous forecast set wholesale.
    pub forecasts: Vec<Forecast>,
}

/// Persistence for per-metric filter state and its history.
///
/// Implementations must not swallow write failures. Reads of absent data
/// return empty values rather than errors.
pub trait StateStore: Send + Sync {
    fn load(&self, key: &MetricKey) -> StoreResult<Option<MetricState>>;

    /// Make `state` current and append it to the snapshot history.
    fn save(&self, key: &MetricKey, state: &MetricState) -> StoreResult<()>;

    /// Append an innovation. An innovation with the same cycle number as the
    /// newest stored one replaces it, so retried cycles do not duplicate.
    fn append_innovation(&self, key: &MetricKey, innovation: &Innovation) -> StoreResult<()>;

    /// The newest `window` innovations, oldest first.
    fn read_innovations(&self, key: &MetricKey, window: usize) -> StoreResult<Vec<Innovation>>;

    /// The newest `limit` state snapshots, oldest first.
    fn snapshots(&self, key: &MetricKey, limit: usize) -> StoreResult<Vec<MetricState>>;

    fn save_forecasts(&self, key: &MetricKey, forecasts: &[Forecast]) -> StoreResult<()>;

    fn load_forecasts(&self, key: &MetricKey) -> StoreResult<Vec<Forecast>>;

    fn append_anomalies(&self, key: &MetricKey, anomalies: &[Anomaly]) -> StoreResult<()>;

    /// All retained anomalies, oldest first.
    fn read_anomalies(&self, key: &MetricKey) -> StoreResult<Vec<Anomaly>>;

    /// Replace a stored anomaly with the same id.
    fn update_anomaly(&self, key: &MetricKey, anomaly: &Anomaly) -> StoreResult<()>;

    fn load_registry(&self) -> StoreResult<RegistrySnapshot>;

    fn save_registry(&self, registry: &RegistrySnapshot) -> StoreResult<()>;

    /// Persist one cycle as a single unit: after a failure the stored state,
    /// history and forecasts are exactly what they were before the call.
    fn commit_cycle(&self, key: &MetricKey, commit: &CycleCommit) -> StoreResult<()>;
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn load(&self, key: &MetricKey) -> StoreResult<Option<MetricState>> {
        (**self).load(key)
    }

    fn save(&self, key: &MetricKey, state: &MetricState) -> StoreResult<()> {
        (**self).save(key, state)
    }

    fn append_innovation(&self, key: &MetricKey, innovation: &Innovation) -> StoreResult<()> {
        (**self).append_innovation(key, innovation)
    }

    fn read_innovations(&self, key: &MetricKey, window: usize) -> StoreResult<Vec<Innovation>> {
        (**self).read_innovations(key, window)
    }

    fn snapshots(&self, key: &MetricKey, limit: usize) -> StoreResult<Vec<MetricState>> {
        (**self).snapshots(key, limit)
    }

    fn save_forecasts(&self, key: &MetricKey, forecasts: &[Forecast]) -> StoreResult<()> {
        (**self).save_forecasts(key, forecasts)
    }

    fn load_forecasts(&self, key: &MetricKey) -> StoreResult<Vec<Forecast>> {
        (**self).load_forecasts(key)
    }

    fn append_anomalies(&self, key: &MetricKey, anomalies: &[Anomaly]) -> StoreResult<()> {
        (**self).append_anomalies(key, anomalies)
    }

    fn read_anomalies(&self, key: &MetricKey) -> StoreResult<Vec<Anomaly>> {
        (**self).read_anomalies(key)
    }

    fn update_anomaly(&self, key: &MetricKey, anomaly: &Anomaly) -> StoreResult<()> {
        (**self).update_anomaly(key, anomaly)
    }

    fn load_registry(&self) -> StoreResult<RegistrySnapshot> {
        (**self).load_registry()
    }

    fn save_registry(&self, registry: &RegistrySnapshot) -> StoreResult<()> {
        (**self).save_registry(registry)
    }

    fn commit_cycle(&self, key: &MetricKey, commit: &CycleCommit) -> StoreResult<()> {
        (**self).commit_cycle(key, commit)
    }
}

/// Everything a backend keeps for one metric.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct MetricRecord {
    pub current: Option<MetricState>,
    pub snapshots: Vec<MetricState>,
    pub innovations: Vec<Innovation>,
    pub forecasts: Vec<Forecast>,
    pub anomalies: Vec<Anomaly>,
}

impl MetricRecord {
    pub fn apply_save(&mut self, state: &MetricState, retention: RetentionPolicy) {
        self.current = Some(state.clone());
        push_bounded(
            &mut self.snapshots,
            state.clone(),
            retention.snapshots,
            same_snapshot,
        );
    }

    pub fn apply_innovation(&mut self, innovation: &Innovation, retention: RetentionPolicy) {
        push_bounded(
            &mut self.innovations,
            innovation.clone(),
            retention.innovations,
            |a, b| a.cycle == b.cycle,
        );
    }

    pub fn apply_anomalies(&mut self, anomalies: &[Anomaly], retention: RetentionPolicy) {
        for anomaly in anomalies {
            // A retried cycle re-detects the same innovation.
            self.anomalies
                .retain(|a| a.innovation_ref != anomaly.innovation_ref);
            self.anomalies.push(anomaly.clone());
        }
        trim_front(&mut self.anomalies, retention.anomalies);
    }

    pub fn replace_anomaly(&mut self, anomaly: &Anomaly) -> StoreResult<()> {
        let slot = self
            .anomalies
            .iter_mut()
            .find(|a| a.id == anomaly.id)
            .ok_or_else(|| StoreError::NotFound(format!("anomaly {}", anomaly.id)))?;
        *slot = anomaly.clone();
        Ok(())
    }

    /// The record as it stands after `commit`, leaving `self` untouched.
    pub fn staged(&self, commit: &CycleCommit, retention: RetentionPolicy) -> Self {
        let mut staged = self.clone();
        if let Some(innovation) = &commit.innovation {
            staged.apply_innovation(innovation, retention);
        }
        staged.apply_anomalies(&commit.anomalies, retention);
        staged.forecasts = commit.forecasts.clone();
        staged.apply_save(&commit.state, retention);
        staged
    }
}

fn same_snapshot(a: &MetricState, b: &MetricState) -> bool {
    a.cycle == b.cycle && a.model_version == b.model_version && a.phase == b.phase
}

/// Append `item` to `items`, replacing the last entry when `same` says they
/// describe the same record, then trim from the front to `cap`.
fn push_bounded<T>(
    items: &mut Vec<T>,
    item: T,
    cap: usize,
    same: impl Fn(&T, &T) -> bool,
) {
    match items.last_mut() {
        Some(last) if same(last, &item) => *last = item,
        _ => items.push(item),
    }
    trim_front(items, cap);
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let drain = items.len() - cap;
        items.drain(..drain);
    }
}

pub(crate) fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}
