//! Data model shared by the engine, its store, and its callers.
//!
//! [`MetricState`] is owned by the Kalman core and only mutated through its
//! predict/update operations. Everything else here is either an input
//! ([`Observation`]), a per-cycle derivation ([`FusedMeasurement`],
//! [`Innovation`], [`Forecast`]) or an audit artifact ([`Anomaly`],
//! [`CalibrationResult`]).

use chrono::{DateTime, Utc};
use ke_math::{Mat2, Vec2};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::id::{MetricKind, SourceId, TenantId};
use crate::schema::SCHEMA_VERSION;

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

// ── Filter state ────────────────────────────────────────────────────────

/// Lifecycle of a metric filter. `Uninitialized` is represented by the
/// absence of a [`MetricState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FilterPhase {
    /// Seeded, no measurement update applied yet.
    Initialized,
    /// At least one measurement update applied; see [`MetricState::cycle`].
    Updated,
}

/// Last posterior, kept while predictions accumulate without an update.
///
/// Predictions are always recomputed from the anchor with the total elapsed
/// time, so two predicts of Δt=1 equal one predict of Δt=2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PredictionAnchor {
    pub state_vector: Vec2,
    #[schemars(with = "[[f64; 2]; 2]")]
    pub covariance_matrix: Mat2,
}

/// Filter state for one `(tenant, metric)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricState {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub tenant: TenantId,
    pub metric: MetricKind,
    /// `[value, trend]`; trend is change per model period.
    pub state_vector: Vec2,
    /// Symmetric PSD uncertainty of `state_vector`.
    #[schemars(with = "[[f64; 2]; 2]")]
    pub covariance_matrix: Mat2,
    /// Process noise Q per model period.
    #[schemars(with = "[[f64; 2]; 2]")]
    pub process_noise: Mat2,
    pub last_updated: DateTime<Utc>,
    /// Bumped whenever noise parameters change or the state is reseeded.
    pub model_version: u64,
    pub phase: FilterPhase,
    /// Number of measurement updates applied.
    pub cycle: u64,
    /// Value-component gain of the most recent update.
    #[serde(default)]
    pub last_gain: Option<f64>,
    /// Periods predicted forward since the anchor.
    #[serde(default)]
    pub pending_periods: f64,
    #[serde(default)]
    pub anchor: Option<PredictionAnchor>,
    /// Calibrated multipliers on each source's measurement variance R.
    #[serde(default)]
    pub source_noise_scale: BTreeMap<SourceId, f64>,
}

impl MetricState {
    pub fn value(&self) -> f64 {
        self.state_vector[0]
    }

    pub fn trend(&self) -> f64 {
        self.state_vector[1]
    }

    pub fn value_variance(&self) -> f64 {
        self.covariance_matrix.get(0, 0)
    }

    pub fn value_std_dev(&self) -> f64 {
        self.value_variance().max(0.0).sqrt()
    }

    /// Multiplier on a source's measurement variance (1.0 when uncalibrated).
    pub fn noise_scale_for(&self, source: &SourceId) -> f64 {
        self.source_noise_scale.get(source).copied().unwrap_or(1.0)
    }
}

// ── Sources and observations ────────────────────────────────────────────

/// Declared trust and latency of a source for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceDescriptor {
    pub source_id: SourceId,
    pub metric: MetricKind,
    /// In `(0, 1]`.
    pub base_confidence: f64,
    pub latency_seconds: u64,
    /// Every metric this source is registered for.
    pub supported_metrics: Vec<MetricKind>,
    pub registered_at: DateTime<Utc>,
}

/// A source flagged for confidence review after a severe residual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DownweightReview {
    pub source_id: SourceId,
    pub metric: MetricKind,
    pub tenant: TenantId,
    pub anomaly_id: Uuid,
    pub normalized_residual: f64,
    pub flagged_at: DateTime<Utc>,
}

/// Persisted form of the source registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub pending_reviews: Vec<DownweightReview>,
}

/// One raw reading from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Observation {
    pub source_id: SourceId,
    pub metric: MetricKind,
    pub raw_value: f64,
    pub timestamp: DateTime<Utc>,
    pub declared_confidence: f64,
}

/// Contribution of one observation to a fused measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceWeight {
    pub source_id: SourceId,
    /// Normalized value (ratio metrics in `[0, 1]`).
    pub value: f64,
    pub variance: f64,
    /// Share of the inverse-variance total; weights sum to 1.
    pub weight: f64,
}

/// Single effective measurement for a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FusedMeasurement {
    pub metric: MetricKind,
    pub value: f64,
    pub variance: f64,
    /// Timestamp of the newest contributing observation.
    pub timestamp: DateTime<Utc>,
    pub contributions: Vec<SourceWeight>,
}

impl FusedMeasurement {
    /// The contributing source whose value lies farthest from `reference`.
    pub fn most_deviant_source(&self, reference: f64) -> Option<&SourceId> {
        self.contributions
            .iter()
            .max_by(|a, b| {
                (a.value - reference)
                    .abs()
                    .total_cmp(&(b.value - reference).abs())
            })
            .map(|c| &c.source_id)
    }
}

// ── Innovations and anomalies ───────────────────────────────────────────

/// Discrepancy between prediction and fused measurement for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Innovation {
    /// Filter cycle this innovation produced.
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    pub fused_value: f64,
    /// `y = z - H·x'`.
    pub residual: f64,
    /// `S = H·P'·Hᵗ + R`, after the epsilon clamp.
    pub innovation_variance: f64,
    /// `y / √S`.
    pub normalized_residual: f64,
    /// Source attributed with the residual (farthest from the prediction).
    pub source_id: Option<SourceId>,
    /// Value-component Kalman gain applied.
    pub gain: f64,
    /// Prior value variance over measurement variance.
    pub signal_to_noise_ratio: f64,
}

/// Anomaly severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Severe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Open,
    Resolved,
}

/// An innovation whose normalized residual crossed a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Anomaly {
    pub id: Uuid,
    pub tenant: TenantId,
    pub metric: MetricKind,
    /// Cycle of the innovation that triggered this anomaly.
    pub innovation_ref: u64,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    pub normalized_residual: f64,
    pub observed_value: f64,
    pub expected_lower: f64,
    pub expected_upper: f64,
    pub classification_hint: String,
    /// Source recommended for confidence review, if any.
    #[serde(default)]
    pub downweight_candidate: Option<SourceId>,
    pub status: AnomalyStatus,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

// ── Forecasts ───────────────────────────────────────────────────────────

/// Projection for one future period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Forecast {
    pub metric: MetricKind,
    pub horizon_day: u32,
    pub predicted_value: f64,
    pub ci68_lower: f64,
    pub ci68_upper: f64,
    pub ci95_lower: f64,
    pub ci95_upper: f64,
    /// Strictly decreasing with `horizon_day`.
    pub model_confidence: f64,
}

// ── Calibration ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationVerdict {
    /// Residual variance within tolerance; no change recommended.
    Calibrated,
    /// Residuals wider than the filter believes: noise is underestimated.
    Overconfident,
    /// Residuals narrower than the filter believes: noise is overestimated.
    Underconfident,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub samples: usize,
    pub requested: usize,
}

/// Recommended noise adjustment. Never applied implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CalibrationResult {
    pub tenant: TenantId,
    pub metric: MetricKind,
    pub verdict: CalibrationVerdict,
    /// Sample variance of normalized residuals (1.0 when well calibrated).
    pub observed_variance: Option<f64>,
    pub residual_mean: Option<f64>,
    /// Clipped factor applied to Q.
    pub q_scale: f64,
    #[schemars(with = "[[f64; 2]; 2]")]
    pub current_q: Mat2,
    #[schemars(with = "[[f64; 2]; 2]")]
    pub recommended_q: Mat2,
    /// Normalized-residual variance attributed to each source.
    pub source_variances: BTreeMap<SourceId, f64>,
    /// Recommended R multiplier per source.
    pub recommended_r_per_source: BTreeMap<SourceId, f64>,
    pub evaluation_window: EvaluationWindow,
    /// `model_version` of the state this result was computed against.
    pub based_on_version: u64,
    pub config_hash: String,
    pub generated_at: DateTime<Utc>,
}

impl CalibrationResult {
    /// Whether applying this result would change anything.
    pub fn recommends_change(&self) -> bool {
        matches!(
            self.verdict,
            CalibrationVerdict::Overconfident | CalibrationVerdict::Underconfident
        ) || !self.recommended_r_per_source.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn severity_orders_by_seriousness() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Severe);
    }

    #[test]
    fn most_deviant_source_picks_farthest() {
        let fused = FusedMeasurement {
            metric: MetricKind::Mrr,
            value: 100.0,
            variance: 1.0,
            timestamp: ts("2026-01-01T00:00:00Z"),
            contributions: vec![
                SourceWeight {
                    source_id: "a".into(),
                    value: 99.0,
                    variance: 1.0,
                    weight: 0.5,
                },
                SourceWeight {
                    source_id: "b".into(),
                    value: 140.0,
                    variance: 1.0,
                    weight: 0.5,
                },
            ],
        };
        assert_eq!(fused.most_deviant_source(100.0).unwrap().as_str(), "b");
    }

    #[test]
    fn metric_state_round_trips_with_defaults() {
        let json = r#"{
            "tenant": "acme",
            "metric": "mrr",
            "state_vector": [850000.0, 0.0],
            "covariance_matrix": [[10000.0, 0.0], [0.0, 100.0]],
            "process_noise": [[1.0, 0.0], [0.0, 1.0]],
            "last_updated": "2026-01-01T00:00:00Z",
            "model_version": 1,
            "phase": "initialized",
            "cycle": 0
        }"#;
        let state: MetricState = serde_json::from_str(json).unwrap();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.value(), 850000.0);
        assert_eq!(state.value_variance(), 10000.0);
        assert!(state.anchor.is_none());
        assert_eq!(state.noise_scale_for(&"stripe".into()), 1.0);
    }
}
