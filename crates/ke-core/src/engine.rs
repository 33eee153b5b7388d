//! The estimation engine: one synchronous pipeline per cycle.
//!
//! ```text
//! load ─► fuse ─► (seed | predict ─► update) ─► detect ─► forecast ─► commit
//! ```
//!
//! Each `(tenant, metric)` has its own lock, so cycles for different metrics
//! run in parallel while cycles for one metric are serialized. A cycle works
//! on owned copies and persists everything through a single
//! [`StateStore::commit_cycle`]; any failure before that leaves the stored
//! state untouched, so retrying is always safe.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ke_common::{
    Anomaly, AnomalyStatus, CalibrationResult, DownweightReview, Error, MetricKey, MetricKind,
    MetricState, RegistrySnapshot, Result, SourceDescriptor, SourceId, TenantId, SCHEMA_VERSION,
};
use ke_config::EngineConfig;
use ke_store::{CycleCommit, StateStore, StoreError};

use crate::anomaly::AnomalyDetector;
use crate::api::{ConfidenceInterval, EstimateRequest, EstimateResponse, StateView};
use crate::calibrate::Calibrator;
use crate::filter::KalmanCore;
use crate::forecast::{Forecaster, Z_95};
use crate::normalize::Normalizer;
use crate::registry::SourceRegistry;

fn persistence(key: &MetricKey, at: Option<DateTime<Utc>>) -> impl FnOnce(StoreError) -> Error {
    let tenant = key.tenant.clone();
    let metric = key.metric;
    move |err| Error::PersistenceFailure {
        tenant,
        metric,
        at,
        reason: err.to_string(),
    }
}

fn registry_failure(err: StoreError) -> Error {
    Error::RegistryPersistence(err.to_string())
}

/// Estimation engine over a [`StateStore`].
pub struct Engine<S: StateStore> {
    config: Arc<EngineConfig>,
    config_hash: String,
    default_tenant: TenantId,
    store: S,
    registry: RwLock<SourceRegistry>,
    locks: Mutex<HashMap<MetricKey, Arc<Mutex<()>>>>,
}

impl<S: StateStore> Engine<S> {
    /// Validate `config` and load the source registry from `store`.
    pub fn new(config: EngineConfig, store: S) -> Result<Self> {
        let report = ke_config::validate::validate(&config);
        if !report.is_ok() {
            return Err(Error::InvalidConfiguration(report.summary()));
        }
        let config_hash = ke_config::snapshot::config_hash(&config)?;
        let registry = SourceRegistry::from_snapshot(store.load_registry().map_err(registry_failure)?)?;
        debug!(
            config_hash = %config_hash,
            sources = registry.len(),
            "engine ready"
        );
        Ok(Self {
            config: Arc::new(config),
            config_hash,
            default_tenant: TenantId::default_tenant(),
            store,
            registry: RwLock::new(registry),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Tenant used when a call does not name one.
    pub fn with_default_tenant(mut self, tenant: TenantId) -> Self {
        self.default_tenant = tenant;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolve_tenant(&self, tenant: Option<&str>) -> Result<TenantId> {
        match tenant {
            None => Ok(self.default_tenant.clone()),
            Some(raw) => TenantId::parse(raw)
                .ok_or_else(|| Error::InvalidInput(format!("invalid tenant id: {raw:?}"))),
        }
    }

    fn metric_lock(&self, key: &MetricKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, SourceRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage a registry change, persist it, then publish it.
    fn mutate_registry<T>(
        &self,
        change: impl FnOnce(&mut SourceRegistry) -> Result<T>,
    ) -> Result<T> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = registry.clone();
        let out = change(&mut staged)?;
        self.store
            .save_registry(&staged.snapshot())
            .map_err(registry_failure)?;
        *registry = staged;
        Ok(out)
    }

    fn periods_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let seconds = (to - from).num_milliseconds() as f64 / 1000.0;
        (seconds / self.config.period_seconds as f64).max(0.0)
    }

    fn load_required(&self, key: &MetricKey) -> Result<MetricState> {
        self.store
            .load(key)
            .map_err(persistence(key, None))?
            .ok_or_else(|| Error::NotInitialized {
                tenant: key.tenant.clone(),
                metric: key.metric,
            })
    }

    // ── Invocation surface ──────────────────────────────────────────────

    /// Run one estimation cycle.
    pub fn estimate(&self, request: EstimateRequest) -> Result<EstimateResponse> {
        let tenant = self.resolve_tenant(request.tenant.as_deref())?;
        let metric = request.metric;
        let as_of = request.as_of.unwrap_or_else(Utc::now);
        let forecaster = Forecaster::new(&self.config.forecast);
        let horizon = request
            .forecast_horizon
            .unwrap_or(i64::from(self.config.forecast.default_horizon));
        forecaster.check_horizon(horizon)?;
        let observations = request.to_observations(as_of)?;

        let key = MetricKey::new(tenant.clone(), metric);
        let lock = self.metric_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let stored = self.store.load(&key).map_err(persistence(&key, Some(as_of)))?;
        let report = {
            let registry = self.read_registry();
            Normalizer::new(&self.config, &registry).fuse(
                metric,
                &observations,
                stored.as_ref(),
                as_of,
            )?
        };
        let fused = &report.measurement;
        let mut warnings = report.warnings.clone();

        let mut core = KalmanCore::new(tenant.clone(), Arc::clone(&self.config));
        let innovation = match stored {
            None => {
                core.seed(fused)?;
                None
            }
            Some(previous) => {
                if fused.timestamp < previous.last_updated {
                    warnings.push(format!(
                        "measurement at {} predates last update at {}; no time advance",
                        fused.timestamp.to_rfc3339(),
                        previous.last_updated.to_rfc3339()
                    ));
                }
                let elapsed = self.periods_between(previous.last_updated, fused.timestamp);
                core.restore(previous)?;
                core.predict(metric, elapsed)?;
                Some(core.update(metric, fused)?)
            }
        };
        let state = core.take(metric)?;

        let detection = innovation
            .as_ref()
            .and_then(|i| AnomalyDetector::new(&self.config.anomaly).inspect(&tenant, metric, i));
        let forecasts = forecaster.forecast(&state, horizon)?;

        let (anomalies, review) = match detection {
            Some(d) => (vec![d.anomaly], d.review),
            None => (Vec::new(), None),
        };
        for anomaly in &anomalies {
            warn!(
                %tenant,
                %metric,
                cycle = anomaly.innovation_ref,
                severity = ?anomaly.severity,
                normalized_residual = anomaly.normalized_residual,
                "anomaly detected"
            );
        }

        let commit = CycleCommit {
            state,
            innovation,
            anomalies,
            forecasts,
        };
        self.store
            .commit_cycle(&key, &commit)
            .map_err(persistence(&key, Some(fused.timestamp)))?;

        let CycleCommit {
            state,
            innovation,
            anomalies,
            forecasts,
        } = commit;
        info!(
            %tenant,
            %metric,
            cycle = state.cycle,
            value = state.value(),
            seeded = innovation.is_none(),
            "estimation cycle committed"
        );

        // Only a committed cycle may leave a review behind.
        if let Some(review) = review {
            warn!(
                %tenant,
                %metric,
                source_id = %review.source_id,
                normalized_residual = review.normalized_residual,
                "source flagged for confidence review"
            );
            let source_id = review.source_id.clone();
            if let Err(e) = self.mutate_registry(|registry| {
                registry.flag_for_review(review);
                Ok(())
            }) {
                warn!(%tenant, %metric, %source_id, error = %e, "review not recorded");
                warnings.push(format!(
                    "confidence review for source {source_id} not recorded: {e}"
                ));
            }
        }

        let sigma = state.value_std_dev();
        let bound = |v: f64| if metric.is_ratio() { v.clamp(0.0, 1.0) } else { v };
        let seed_snr = self.config.profile(metric).seed_variance_multiplier;
        Ok(EstimateResponse {
            estimated_value: state.value(),
            confidence_interval: ConfidenceInterval {
                lower: bound(state.value() - Z_95 * sigma),
                upper: bound(state.value() + Z_95 * sigma),
                level: 0.95,
            },
            trend: state.trend(),
            kalman_gain: innovation.as_ref().map_or(1.0, |i| i.gain),
            innovation: innovation.as_ref().map_or(0.0, |i| i.residual),
            signal_to_noise_ratio: innovation
                .as_ref()
                .map_or(seed_snr, |i| i.signal_to_noise_ratio),
            forecasts,
            anomalies,
            schema_version: SCHEMA_VERSION.to_string(),
            tenant,
            metric,
            as_of,
            cycle: state.cycle,
            model_version: state.model_version,
            seeded: innovation.is_none(),
            normalized_innovation: innovation.as_ref().map_or(0.0, |i| i.normalized_residual),
            fused_measurement: report.measurement,
            excluded_sources: report.excluded,
            warnings,
        })
    }

    /// Explicitly initialize a metric. With `force`, an existing state is
    /// superseded by a fresh seed.
    pub fn initialize(
        &self,
        tenant: Option<&str>,
        metric: MetricKind,
        initial_value: f64,
        initial_variance: f64,
        force: bool,
    ) -> Result<MetricState> {
        let tenant = self.resolve_tenant(tenant)?;
        let key = MetricKey::new(tenant.clone(), metric);
        let at = Utc::now();
        let lock = self.metric_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut core = KalmanCore::new(tenant.clone(), Arc::clone(&self.config));
        match self.store.load(&key).map_err(persistence(&key, Some(at)))? {
            Some(_) if !force => {
                return Err(Error::AlreadyInitialized { tenant, metric });
            }
            Some(previous) => {
                core.restore(previous)?;
                core.reseed(metric, initial_value, initial_variance, at)?;
            }
            None => {
                core.initialize(metric, initial_value, initial_variance, at)?;
            }
        }
        let state = core.take(metric)?;
        self.store
            .commit_cycle(
                &key,
                &CycleCommit {
                    state: state.clone(),
                    innovation: None,
                    anomalies: Vec::new(),
                    forecasts: Vec::new(),
                },
            )
            .map_err(persistence(&key, Some(at)))?;
        Ok(state)
    }

    /// Current state plus recent history. Never mutates anything.
    pub fn get_state(
        &self,
        tenant: Option<&str>,
        metric: MetricKind,
        history: usize,
    ) -> Result<StateView> {
        let tenant = self.resolve_tenant(tenant)?;
        let key = MetricKey::new(tenant.clone(), metric);
        let lock = self.metric_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self.load_required(&key)?;
        let recent_innovations = self
            .store
            .read_innovations(&key, history)
            .map_err(persistence(&key, None))?;
        let forecasts = self
            .store
            .load_forecasts(&key)
            .map_err(persistence(&key, None))?;
        let open_anomalies = self
            .store
            .read_anomalies(&key)
            .map_err(persistence(&key, None))?
            .into_iter()
            .filter(|a| a.status == AnomalyStatus::Open)
            .collect();
        let snapshot_count = self
            .store
            .snapshots(&key, usize::MAX)
            .map_err(persistence(&key, None))?
            .len();
        let pending_reviews = self
            .read_registry()
            .pending_reviews()
            .iter()
            .filter(|r| r.tenant == tenant && r.metric == metric)
            .cloned()
            .collect();
        Ok(StateView {
            state,
            recent_innovations,
            forecasts,
            open_anomalies,
            snapshot_count,
            pending_reviews,
        })
    }

    /// Evaluate calibration without applying it.
    pub fn calibrate(&self, tenant: Option<&str>, metric: MetricKind) -> Result<CalibrationResult> {
        let tenant = self.resolve_tenant(tenant)?;
        let key = MetricKey::new(tenant, metric);
        let state = self.load_required(&key)?;
        let innovations = self
            .store
            .read_innovations(&key, self.config.calibration.window)
            .map_err(persistence(&key, None))?;
        Ok(Calibrator::new(&self.config.calibration, &self.config_hash).evaluate(
            &state,
            &innovations,
            Utc::now(),
        ))
    }

    /// Apply a reviewed calibration. Takes effect from the next cycle.
    pub fn apply_calibration(&self, result: &CalibrationResult) -> Result<MetricState> {
        let key = MetricKey::new(result.tenant.clone(), result.metric);
        let lock = self.metric_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.load_required(&key)?;
        let previous_version = previous.model_version;
        let mut core = KalmanCore::new(key.tenant.clone(), Arc::clone(&self.config));
        core.restore(previous)?;
        core.apply_calibration(result)?;
        let state = core.take(key.metric)?;
        if state.model_version == previous_version {
            debug!(%key, "calibration recommends no change");
            return Ok(state);
        }

        let horizon = self
            .store
            .load_forecasts(&key)
            .map_err(persistence(&key, None))?
            .len();
        let forecasts = if horizon > 0 {
            Forecaster::new(&self.config.forecast).forecast(&state, horizon as i64)?
        } else {
            Vec::new()
        };
        self.store
            .commit_cycle(
                &key,
                &CycleCommit {
                    state: state.clone(),
                    innovation: None,
                    anomalies: Vec::new(),
                    forecasts,
                },
            )
            .map_err(persistence(&key, Some(Utc::now())))?;
        Ok(state)
    }

    /// Mark an anomaly resolved. Resolving twice is a no-op.
    pub fn resolve_anomaly(
        &self,
        tenant: Option<&str>,
        metric: MetricKind,
        id: Uuid,
    ) -> Result<Anomaly> {
        let tenant = self.resolve_tenant(tenant)?;
        let key = MetricKey::new(tenant, metric);
        let lock = self.metric_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut anomaly = self
            .store
            .read_anomalies(&key)
            .map_err(persistence(&key, None))?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::AnomalyNotFound(id.to_string()))?;
        if anomaly.status == AnomalyStatus::Resolved {
            return Ok(anomaly);
        }
        anomaly.status = AnomalyStatus::Resolved;
        anomaly.resolved_at = Some(Utc::now());
        self.store
            .update_anomaly(&key, &anomaly)
            .map_err(persistence(&key, None))?;
        info!(%key, anomaly_id = %id, "anomaly resolved");
        Ok(anomaly)
    }

    // ── Source registry ─────────────────────────────────────────────────

    pub fn register_source(
        &self,
        source_id: SourceId,
        metric: MetricKind,
        base_confidence: f64,
        latency_seconds: u64,
    ) -> Result<SourceDescriptor> {
        self.mutate_registry(|registry| {
            registry
                .register(source_id, metric, base_confidence, latency_seconds)
                .cloned()
        })
    }

    pub fn describe_source(&self, source_id: &SourceId, metric: MetricKind) -> Result<SourceDescriptor> {
        self.read_registry().describe(source_id, metric).cloned()
    }

    pub fn sources(&self) -> RegistrySnapshot {
        self.read_registry().snapshot()
    }

    pub fn pending_reviews(&self) -> Vec<DownweightReview> {
        self.read_registry().pending_reviews().to_vec()
    }

    /// Accept a down-weight review by setting a new base confidence.
    pub fn apply_review(
        &self,
        source_id: &SourceId,
        metric: MetricKind,
        new_confidence: f64,
    ) -> Result<SourceDescriptor> {
        self.mutate_registry(|registry| {
            registry
                .apply_review(source_id, metric, new_confidence)
                .cloned()
        })
    }

    /// Reject a down-weight review; returns how many were dropped.
    pub fn dismiss_review(&self, source_id: &SourceId, metric: MetricKind) -> Result<usize> {
        self.mutate_registry(|registry| Ok(registry.dismiss_review(source_id, metric)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ObservationInput;
    use chrono::Duration;
    use ke_common::{FilterPhase, Severity};
    use ke_store::MemoryStore;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn engine() -> Engine<MemoryStore> {
        Engine::new(EngineConfig::default(), MemoryStore::new()).unwrap()
    }

    fn input(source: &str, value: f64, confidence: f64) -> ObservationInput {
        ObservationInput {
            source_id: source.into(),
            metric: None,
            value,
            confidence,
            timestamp: None,
        }
    }

    fn request(day: i64, observations: Vec<ObservationInput>) -> EstimateRequest {
        EstimateRequest {
            tenant: None,
            metric: MetricKind::Mrr,
            observations,
            forecast_horizon: Some(7),
            as_of: Some(t0() + Duration::days(day)),
        }
    }

    #[test]
    fn test_first_cycle_seeds() {
        let engine = engine();
        let resp = engine
            .estimate(request(0, vec![input("stripe", 100_000.0, 0.9)]))
            .unwrap();
        assert!(resp.seeded);
        assert_eq!(resp.kalman_gain, 1.0);
        assert_eq!(resp.innovation, 0.0);
        assert!(resp.anomalies.is_empty());
        assert_eq!(resp.forecasts.len(), 7);
        assert_eq!(resp.estimated_value, 100_000.0);
        assert!(resp.confidence_interval.lower < 100_000.0);

        let view = engine.get_state(None, MetricKind::Mrr, 10).unwrap();
        assert_eq!(view.state.cycle, 1);
        assert_eq!(view.state.phase, FilterPhase::Updated);
        assert!(view.recent_innovations.is_empty());
        assert_eq!(view.forecasts.len(), 7);
        assert_eq!(view.snapshot_count, 1);
    }

    #[test]
    fn test_second_cycle_updates() {
        let engine = engine();
        engine
            .estimate(request(0, vec![input("stripe", 100_000.0, 0.9)]))
            .unwrap();
        let resp = engine
            .estimate(request(1, vec![input("stripe", 101_000.0, 0.9)]))
            .unwrap();
        assert!(!resp.seeded);
        assert!(resp.kalman_gain > 0.0 && resp.kalman_gain < 1.0);
        assert_eq!(resp.cycle, 2);
        assert!(resp.estimated_value > 100_000.0 && resp.estimated_value < 101_000.0);
        let expected = resp.signal_to_noise_ratio / (1.0 + resp.signal_to_noise_ratio);
        assert!((resp.kalman_gain - expected).abs() < 1e-9);

        let view = engine.get_state(None, MetricKind::Mrr, 10).unwrap();
        assert_eq!(view.recent_innovations.len(), 1);
        assert_eq!(view.snapshot_count, 2);
    }

    #[test]
    fn test_invalid_horizon_rejected_before_any_write() {
        let engine = engine();
        let mut req = request(0, vec![input("stripe", 1.0, 0.9)]);
        req.forecast_horizon = Some(0);
        assert!(matches!(
            engine.estimate(req),
            Err(Error::InvalidHorizon { .. })
        ));
        assert!(matches!(
            engine.get_state(None, MetricKind::Mrr, 1),
            Err(Error::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_no_observations_skips_cycle() {
        let engine = engine();
        assert!(matches!(
            engine.estimate(request(0, vec![])),
            Err(Error::NoObservations { .. })
        ));
    }

    #[test]
    fn test_initialize_and_force() {
        let engine = engine();
        engine
            .initialize(None, MetricKind::Cac, 50.0, 4.0, false)
            .unwrap();
        assert!(matches!(
            engine.initialize(None, MetricKind::Cac, 60.0, 4.0, false),
            Err(Error::AlreadyInitialized { .. })
        ));
        let state = engine
            .initialize(None, MetricKind::Cac, 60.0, 4.0, true)
            .unwrap();
        assert_eq!(state.value(), 60.0);
        assert_eq!(state.model_version, 2);
    }

    #[test]
    fn test_invalid_tenant_rejected() {
        let engine = engine();
        let mut req = request(0, vec![input("stripe", 1.0, 0.9)]);
        req.tenant = Some("Not A Tenant".into());
        assert!(matches!(engine.estimate(req), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_severe_anomaly_flags_review_and_resolves() {
        let engine = engine();
        engine
            .register_source("stripe".into(), MetricKind::Mrr, 0.95, 3600)
            .unwrap();
        for day in 0..5 {
            engine
                .estimate(request(day, vec![input("stripe", 100_000.0, 0.95)]))
                .unwrap();
        }
        let resp = engine
            .estimate(request(5, vec![input("stripe", 400_000.0, 0.95)]))
            .unwrap();
        assert_eq!(resp.anomalies.len(), 1);
        let anomaly = &resp.anomalies[0];
        assert_eq!(anomaly.severity, Severity::Severe);
        assert_eq!(anomaly.downweight_candidate, Some("stripe".into()));
        assert_eq!(engine.pending_reviews().len(), 1);

        let view = engine.get_state(None, MetricKind::Mrr, 10).unwrap();
        assert_eq!(view.open_anomalies.len(), 1);
        assert_eq!(view.pending_reviews.len(), 1);

        let resolved = engine
            .resolve_anomaly(None, MetricKind::Mrr, anomaly.id)
            .unwrap();
        assert_eq!(resolved.status, AnomalyStatus::Resolved);
        let again = engine
            .resolve_anomaly(None, MetricKind::Mrr, anomaly.id)
            .unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);
        assert!(engine
            .get_state(None, MetricKind::Mrr, 10)
            .unwrap()
            .open_anomalies
            .is_empty());
        assert!(matches!(
            engine.resolve_anomaly(None, MetricKind::Mrr, Uuid::new_v4()),
            Err(Error::AnomalyNotFound(_))
        ));

        let revised = engine
            .apply_review(&"stripe".into(), MetricKind::Mrr, 0.5)
            .unwrap();
        assert_eq!(revised.base_confidence, 0.5);
        assert!(engine.pending_reviews().is_empty());
    }

    #[test]
    fn test_calibrate_then_apply_is_versioned() {
        let engine = engine();
        engine
            .estimate(request(0, vec![input("stripe", 100_000.0, 0.9)]))
            .unwrap();
        for day in 1..=20 {
            let swing = if day % 2 == 0 { 60_000.0 } else { -60_000.0 };
            engine
                .estimate(request(day, vec![input("stripe", 100_000.0 + swing, 0.999)]))
                .unwrap();
        }
        let result = engine.calibrate(None, MetricKind::Mrr).unwrap();
        assert_eq!(result.based_on_version, 1);
        assert_eq!(result.config_hash, engine.config_hash());
        assert!(result.recommends_change(), "{:?}", result.verdict);

        let state = engine.apply_calibration(&result).unwrap();
        assert_eq!(state.model_version, 2);
        assert_eq!(state.process_noise, result.recommended_q);
        assert!(matches!(
            engine.apply_calibration(&result),
            Err(Error::StaleCalibration { .. })
        ));
    }

    #[test]
    fn test_calibrate_uninitialized_fails() {
        assert!(matches!(
            engine().calibrate(None, MetricKind::Ltv),
            Err(Error::NotInitialized { .. })
        ));
    }
}
