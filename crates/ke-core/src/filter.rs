//! Kalman core: per-metric constant-velocity state estimator.
//!
//! # State Model
//!
//! ```text
//! State:       x = [value, trend]
//! Transition:  F = [[1, Δt], [0, 1]]
//! Observation: H = [1, 0]
//! Predict:     x' = F·x,  P' = F·P·Fᵗ + Q·Δt
//! Update:      y = z − x'₀,  S = P'₀₀ + R,  K = P'·Hᵗ/S
//!              x = x' + K·y,  P = (I − KH)·P'·(I − KH)ᵗ + K·R·Kᵗ   (Joseph form)
//! ```
//!
//! The pure [`predict`] and [`update`] functions never mutate their input;
//! [`KalmanCore`] swaps a metric's state only after a step fully succeeds.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ke_common::{
    CalibrationResult, Error, FilterPhase, FusedMeasurement, Innovation, MetricKind, MetricState,
    PredictionAnchor, Result, TenantId, SCHEMA_VERSION,
};
use ke_config::{EngineConfig, NumericsConfig};
use ke_math::{Mat2, SYMMETRY_TOLERANCE};

use crate::calibrate;

fn instability(state: &MetricState, at: DateTime<Utc>, detail: impl Into<String>) -> Error {
    Error::NumericalInstability {
        tenant: state.tenant.clone(),
        metric: state.metric,
        at,
        detail: detail.into(),
    }
}

/// Symmetrize and floor eigenvalues; fail if the result is not finite.
fn repair(
    state: &MetricState,
    p: &Mat2,
    numerics: &NumericsConfig,
    at: DateTime<Utc>,
    step: &str,
) -> Result<Mat2> {
    if !p.is_finite() {
        return Err(instability(state, at, format!("non-finite covariance after {step}")));
    }
    let fixed = p.stabilize(numerics.eigenvalue_floor);
    if fixed.eigen_floored || fixed.asymmetry > SYMMETRY_TOLERANCE * (1.0 + p.max_abs()) {
        warn!(
            tenant = %state.tenant,
            metric = %state.metric,
            asymmetry = fixed.asymmetry,
            eigen_floored = fixed.eigen_floored,
            step,
            "covariance repaired"
        );
    }
    if !fixed.matrix.is_finite() {
        return Err(instability(state, at, format!("covariance repair failed after {step}")));
    }
    Ok(fixed.matrix)
}

/// Fresh state with zero trend and diagonal covariance.
pub fn seed_state(
    tenant: TenantId,
    metric: MetricKind,
    initial_value: f64,
    initial_variance: f64,
    config: &EngineConfig,
    at: DateTime<Utc>,
) -> Result<MetricState> {
    if !initial_value.is_finite() {
        return Err(Error::InvalidInput(format!(
            "initial value for {metric} must be finite, got {initial_value}"
        )));
    }
    if !(initial_variance.is_finite() && initial_variance > 0.0) {
        return Err(Error::InvalidInput(format!(
            "initial variance for {metric} must be positive, got {initial_variance}"
        )));
    }
    let profile = config.profile(metric);
    Ok(MetricState {
        schema_version: SCHEMA_VERSION.to_string(),
        tenant,
        metric,
        state_vector: [initial_value, 0.0],
        covariance_matrix: Mat2::diag(initial_variance, profile.initial_trend_variance),
        process_noise: profile.process_noise,
        last_updated: at,
        model_version: 1,
        phase: FilterPhase::Initialized,
        cycle: 0,
        last_gain: None,
        pending_periods: 0.0,
        anchor: None,
        source_noise_scale: BTreeMap::new(),
    })
}

/// Advance `state` by `elapsed_periods`.
///
/// The prior is always recomputed from the last posterior (the anchor) over
/// the total elapsed time, so successive calls compound exactly.
pub fn predict(
    state: &MetricState,
    elapsed_periods: f64,
    numerics: &NumericsConfig,
) -> Result<MetricState> {
    if !(elapsed_periods.is_finite() && elapsed_periods >= 0.0) {
        return Err(Error::InvalidInput(format!(
            "elapsed periods must be finite and non-negative, got {elapsed_periods}"
        )));
    }
    let anchor = state.anchor.clone().unwrap_or(PredictionAnchor {
        state_vector: state.state_vector,
        covariance_matrix: state.covariance_matrix,
    });
    let total = state.pending_periods + elapsed_periods;

    let f = Mat2::transition(total);
    let x = f.mul_vec(anchor.state_vector);
    let p = anchor
        .covariance_matrix
        .congruence(&f)
        .add(&state.process_noise.scale(total));

    if !(x[0].is_finite() && x[1].is_finite()) {
        return Err(instability(state, state.last_updated, "non-finite state after predict"));
    }
    let p = repair(state, &p, numerics, state.last_updated, "predict")?;

    let mut next = state.clone();
    next.state_vector = x;
    next.covariance_matrix = p;
    next.pending_periods = total;
    next.anchor = Some(anchor);
    Ok(next)
}

/// Scalar measurement update. Returns the posterior and its innovation.
pub fn update(
    state: &MetricState,
    fused: &FusedMeasurement,
    numerics: &NumericsConfig,
) -> Result<(MetricState, Innovation)> {
    let at = fused.timestamp;
    let r = fused.variance;
    if !(fused.value.is_finite() && r.is_finite() && r >= 0.0) {
        return Err(instability(
            state,
            at,
            format!("unusable measurement value={} variance={r}", fused.value),
        ));
    }

    let x_pred = state.state_vector;
    let p_pred = state.covariance_matrix;
    let prior_var = p_pred.get(0, 0);

    // S = H·P'·Hᵗ + R, clamped away from zero
    let s = (prior_var + r).max(numerics.min_innovation_variance);
    let k = [prior_var / s, p_pred.get(1, 0) / s];
    let y = fused.value - x_pred[0];

    let x = [x_pred[0] + k[0] * y, x_pred[1] + k[1] * y];
    let i_kh = Mat2::new(1.0 - k[0], 0.0, -k[1], 1.0);
    let p = p_pred
        .congruence(&i_kh)
        .add(&Mat2::outer(k, k).scale(r));

    if !(x[0].is_finite() && x[1].is_finite() && s.is_finite()) {
        return Err(instability(state, at, "non-finite state after update"));
    }
    let p = repair(state, &p, numerics, at, "update")?;

    let snr = prior_var / r.max(numerics.min_innovation_variance);
    let cycle = state.cycle + 1;
    let innovation = Innovation {
        cycle,
        timestamp: at,
        predicted_value: x_pred[0],
        fused_value: fused.value,
        residual: y,
        innovation_variance: s,
        normalized_residual: y / s.sqrt(),
        source_id: fused.most_deviant_source(x_pred[0]).cloned(),
        gain: k[0],
        signal_to_noise_ratio: snr,
    };

    let mut next = state.clone();
    next.state_vector = x;
    next.covariance_matrix = p;
    next.last_updated = at.max(state.last_updated);
    next.phase = FilterPhase::Updated;
    next.cycle = cycle;
    next.last_gain = Some(k[0]);
    next.pending_periods = 0.0;
    next.anchor = None;

    debug!(
        tenant = %state.tenant,
        metric = %state.metric,
        cycle,
        gain = k[0],
        normalized_residual = innovation.normalized_residual,
        "measurement applied"
    );
    Ok((next, innovation))
}

/// Owns the [`MetricState`] of every metric for one tenant.
#[derive(Debug, Clone)]
pub struct KalmanCore {
    tenant: TenantId,
    config: Arc<EngineConfig>,
    states: BTreeMap<MetricKind, MetricState>,
}

impl KalmanCore {
    pub fn new(tenant: TenantId, config: Arc<EngineConfig>) -> Self {
        Self {
            tenant,
            config,
            states: BTreeMap::new(),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn not_initialized(&self, metric: MetricKind) -> Error {
        Error::NotInitialized {
            tenant: self.tenant.clone(),
            metric,
        }
    }

    /// Create the state for `metric`. Fails if it already exists.
    pub fn initialize(
        &mut self,
        metric: MetricKind,
        initial_value: f64,
        initial_variance: f64,
        at: DateTime<Utc>,
    ) -> Result<&MetricState> {
        if self.states.contains_key(&metric) {
            return Err(Error::AlreadyInitialized {
                tenant: self.tenant.clone(),
                metric,
            });
        }
        let state = seed_state(
            self.tenant.clone(),
            metric,
            initial_value,
            initial_variance,
            &self.config,
            at,
        )?;
        info!(
            tenant = %self.tenant,
            %metric,
            initial_value,
            initial_variance,
            "metric initialized"
        );
        Ok(self.states.entry(metric).or_insert(state))
    }

    /// Seed from a first fused measurement: the measurement becomes the
    /// state, with its variance widened by the metric's seed multiplier.
    pub fn seed(&mut self, fused: &FusedMeasurement) -> Result<&MetricState> {
        let multiplier = self.config.profile(fused.metric).seed_variance_multiplier;
        let variance = (fused.variance * multiplier).max(self.config.numerics.min_innovation_variance);
        self.initialize(fused.metric, fused.value, variance, fused.timestamp)?;
        let state = self
            .states
            .get_mut(&fused.metric)
            .ok_or_else(|| Error::NotInitialized {
                tenant: self.tenant.clone(),
                metric: fused.metric,
            })?;
        state.phase = FilterPhase::Updated;
        state.cycle = 1;
        state.last_gain = Some(1.0);
        Ok(state)
    }

    /// Replace an existing state with a fresh seed. The new state supersedes
    /// the old one: `model_version` moves forward and `cycle` carries over.
    pub fn reseed(
        &mut self,
        metric: MetricKind,
        initial_value: f64,
        initial_variance: f64,
        at: DateTime<Utc>,
    ) -> Result<&MetricState> {
        let previous = self.state(metric)?;
        let mut next = seed_state(
            self.tenant.clone(),
            metric,
            initial_value,
            initial_variance,
            &self.config,
            at,
        )?;
        next.model_version = previous.model_version + 1;
        next.cycle = previous.cycle;
        info!(
            tenant = %self.tenant,
            %metric,
            model_version = next.model_version,
            "metric reseeded"
        );
        Ok(self.install(next))
    }

    /// Drop a metric's state so it can be initialized again.
    pub fn reset(&mut self, metric: MetricKind) -> Option<MetricState> {
        self.states.remove(&metric)
    }

    /// Adopt a previously persisted state.
    pub fn restore(&mut self, state: MetricState) -> Result<()> {
        if state.tenant != self.tenant {
            return Err(Error::InvalidInput(format!(
                "state belongs to tenant {}, core serves {}",
                state.tenant, self.tenant
            )));
        }
        if !ke_common::schema::is_compatible(&state.schema_version) {
            return Err(Error::InvalidInput(format!(
                "persisted state has unsupported schema version {}",
                state.schema_version
            )));
        }
        if !(state.covariance_matrix.is_finite()
            && state.state_vector.iter().all(|v| v.is_finite()))
        {
            return Err(instability(&state, state.last_updated, "persisted state is not finite"));
        }
        self.states.insert(state.metric, state);
        Ok(())
    }

    /// Remove and return a metric's state.
    pub fn take(&mut self, metric: MetricKind) -> Result<MetricState> {
        self.states
            .remove(&metric)
            .ok_or_else(|| self.not_initialized(metric))
    }

    pub fn predict(&mut self, metric: MetricKind, elapsed_periods: f64) -> Result<&MetricState> {
        let current = self.state(metric)?;
        let next = predict(current, elapsed_periods, &self.config.numerics)?;
        Ok(self.install(next))
    }

    pub fn update(&mut self, metric: MetricKind, fused: &FusedMeasurement) -> Result<Innovation> {
        if fused.metric != metric {
            return Err(Error::InvalidInput(format!(
                "measurement for {} applied to {metric}",
                fused.metric
            )));
        }
        let current = self.state(metric)?;
        let (next, innovation) = update(current, fused, &self.config.numerics)?;
        self.install(next);
        Ok(innovation)
    }

    /// Adopt a reviewed calibration; see [`calibrate::apply`].
    pub fn apply_calibration(&mut self, result: &CalibrationResult) -> Result<&MetricState> {
        let current = self.state(result.metric)?;
        let next = calibrate::apply(result, current)?;
        Ok(self.install(next))
    }

    /// Value-component gain of the last update; 0.0 before any update.
    pub fn kalman_gain(&self, metric: MetricKind) -> Result<f64> {
        Ok(self.state(metric)?.last_gain.unwrap_or(0.0))
    }

    pub fn state(&self, metric: MetricKind) -> Result<&MetricState> {
        self.states
            .get(&metric)
            .ok_or_else(|| self.not_initialized(metric))
    }

    pub fn metrics(&self) -> impl Iterator<Item = MetricKind> + '_ {
        self.states.keys().copied()
    }

    fn install(&mut self, state: MetricState) -> &MetricState {
        let metric = state.metric;
        self.states.insert(metric, state);
        &self.states[&metric]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ke_common::SourceWeight;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn core() -> KalmanCore {
        KalmanCore::new(TenantId::default_tenant(), Arc::new(EngineConfig::default()))
    }

    fn measurement(metric: MetricKind, value: f64, variance: f64) -> FusedMeasurement {
        FusedMeasurement {
            metric,
            value,
            variance,
            timestamp: at(),
            contributions: vec![SourceWeight {
                source_id: "stripe".into(),
                value,
                variance,
                weight: 1.0,
            }],
        }
    }

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn test_initialize() {
        let mut kf = core();
        let state = kf.initialize(MetricKind::Mrr, 850_000.0, 10_000.0, at()).unwrap();
        assert_eq!(state.state_vector, [850_000.0, 0.0]);
        assert_eq!(state.covariance_matrix.get(0, 0), 10_000.0);
        assert_eq!(state.covariance_matrix.get(0, 1), 0.0);
        assert_eq!(state.phase, FilterPhase::Initialized);
        assert_eq!(kf.kalman_gain(MetricKind::Mrr).unwrap(), 0.0);
    }

    #[test]
    fn test_initialize_twice_fails_until_reset() {
        let mut kf = core();
        kf.initialize(MetricKind::Cac, 50.0, 4.0, at()).unwrap();
        assert!(matches!(
            kf.initialize(MetricKind::Cac, 50.0, 4.0, at()),
            Err(Error::AlreadyInitialized { .. })
        ));
        assert!(kf.reset(MetricKind::Cac).is_some());
        assert!(kf.initialize(MetricKind::Cac, 55.0, 4.0, at()).is_ok());
    }

    #[test]
    fn test_uninitialized_operations_fail() {
        let mut kf = core();
        assert!(matches!(
            kf.predict(MetricKind::Ltv, 1.0),
            Err(Error::NotInitialized { .. })
        ));
        assert!(matches!(
            kf.update(MetricKind::Ltv, &measurement(MetricKind::Ltv, 1.0, 1.0)),
            Err(Error::NotInitialized { .. })
        ));
        assert!(kf.kalman_gain(MetricKind::Ltv).is_err());
        assert!(kf.state(MetricKind::Ltv).is_err());
    }

    #[test]
    fn test_predict_follows_trend() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 100.0, 1.0, at()).unwrap();
        let mut state = kf.take(MetricKind::Mrr).unwrap();
        state.state_vector[1] = 5.0;
        kf.restore(state).unwrap();
        let p = kf.predict(MetricKind::Mrr, 3.0).unwrap();
        assert!(approx_eq(p.value(), 115.0, 1e-12));
        assert!(p.value_variance() > 1.0);
    }

    #[test]
    fn test_predict_twice_equals_predict_once() {
        let mut a = core();
        let mut b = core();
        for kf in [&mut a, &mut b] {
            kf.initialize(MetricKind::Mrr, 1000.0, 50.0, at()).unwrap();
            let s = kf.predict(MetricKind::Mrr, 0.0).unwrap().clone();
            assert_eq!(s.state_vector, [1000.0, 0.0]);
        }
        a.predict(MetricKind::Mrr, 1.0).unwrap();
        let a = a.predict(MetricKind::Mrr, 1.0).unwrap().clone();
        let b = b.predict(MetricKind::Mrr, 2.0).unwrap().clone();
        for i in 0..2 {
            assert!(approx_eq(a.state_vector[i], b.state_vector[i], 1e-12));
            for j in 0..2 {
                assert!(approx_eq(
                    a.covariance_matrix.get(i, j),
                    b.covariance_matrix.get(i, j),
                    1e-12
                ));
            }
        }
    }

    #[test]
    fn test_predict_rejects_negative_elapsed() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 1.0, 1.0, at()).unwrap();
        assert!(matches!(
            kf.predict(MetricKind::Mrr, -1.0),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_update_moves_toward_measurement() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 100.0, 100.0, at()).unwrap();
        let inn = kf
            .update(MetricKind::Mrr, &measurement(MetricKind::Mrr, 110.0, 100.0))
            .unwrap();
        let state = kf.state(MetricKind::Mrr).unwrap();
        assert!(approx_eq(inn.gain, 0.5, 1e-12));
        assert!(approx_eq(state.value(), 105.0, 1e-12));
        assert!(approx_eq(state.value_variance(), 50.0, 1e-12));
        assert_eq!(inn.residual, 10.0);
        assert!(approx_eq(inn.normalized_residual, 10.0 / 200f64.sqrt(), 1e-12));
        assert!(approx_eq(inn.signal_to_noise_ratio, 1.0, 1e-12));
        assert_eq!(inn.cycle, 1);
        assert_eq!(state.phase, FilterPhase::Updated);
        assert_eq!(kf.kalman_gain(MetricKind::Mrr).unwrap(), inn.gain);
    }

    #[test]
    fn test_update_clamps_degenerate_innovation_variance() {
        let mut kf = core();
        kf.initialize(MetricKind::Churn, 0.05, 1e-300, at()).unwrap();
        let mut state = kf.take(MetricKind::Churn).unwrap();
        state.covariance_matrix = Mat2::zero();
        kf.restore(state).unwrap();
        let inn = kf
            .update(MetricKind::Churn, &measurement(MetricKind::Churn, 0.06, 0.0))
            .unwrap();
        assert!(inn.normalized_residual.is_finite());
        assert!(inn.innovation_variance >= 1e-12);
        assert!(kf.state(MetricKind::Churn).unwrap().covariance_matrix.is_finite());
    }

    #[test]
    fn test_update_rejects_non_finite_measurement() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 1.0, 1.0, at()).unwrap();
        let before = kf.state(MetricKind::Mrr).unwrap().clone();
        let err = kf
            .update(MetricKind::Mrr, &measurement(MetricKind::Mrr, f64::NAN, 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::NumericalInstability { .. }));
        assert_eq!(kf.state(MetricKind::Mrr).unwrap(), &before);
    }

    #[test]
    fn test_seed_marks_first_cycle() {
        let mut kf = core();
        let state = kf
            .seed(&measurement(MetricKind::Arr, 1_000_000.0, 400.0))
            .unwrap();
        assert_eq!(state.cycle, 1);
        assert_eq!(state.last_gain, Some(1.0));
        assert_eq!(state.value(), 1_000_000.0);
        assert_eq!(state.value_variance(), 1600.0);
    }

    #[test]
    fn test_reseed_supersedes() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 100.0, 10.0, at()).unwrap();
        kf.update(MetricKind::Mrr, &measurement(MetricKind::Mrr, 101.0, 10.0))
            .unwrap();
        let state = kf.reseed(MetricKind::Mrr, 500.0, 20.0, at()).unwrap();
        assert_eq!(state.value(), 500.0);
        assert_eq!(state.model_version, 2);
        assert_eq!(state.cycle, 1);
        assert_eq!(state.phase, FilterPhase::Initialized);
        assert!(kf.reseed(MetricKind::Arr, 1.0, 1.0, at()).is_err());
    }

    #[test]
    fn test_restore_rejects_other_tenant() {
        let mut kf = core();
        let other = seed_state(
            TenantId::parse("acme").unwrap(),
            MetricKind::Mrr,
            1.0,
            1.0,
            &EngineConfig::default(),
            at(),
        )
        .unwrap();
        assert!(kf.restore(other).is_err());
    }

    #[test]
    fn test_restore_rejects_other_schema_major() {
        let mut kf = core();
        let mut state = seed_state(
            TenantId::default_tenant(),
            MetricKind::Mrr,
            1.0,
            1.0,
            &EngineConfig::default(),
            at(),
        )
        .unwrap();
        state.schema_version = "2.0.0".to_string();
        assert!(matches!(kf.restore(state), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_tracks_linear_trend() {
        let mut kf = core();
        kf.initialize(MetricKind::Mrr, 0.0, 1e6, at()).unwrap();
        for day in 1..=60 {
            kf.predict(MetricKind::Mrr, 1.0).unwrap();
            kf.update(
                MetricKind::Mrr,
                &measurement(MetricKind::Mrr, 1000.0 * day as f64, 1e4),
            )
            .unwrap();
        }
        let trend = kf.state(MetricKind::Mrr).unwrap().trend();
        assert!((trend - 1000.0).abs() < 100.0, "trend {trend}");
    }
}
