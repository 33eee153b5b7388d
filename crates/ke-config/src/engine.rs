//! Engine configuration types.
//!
//! Every field has a default so partial config files are valid; missing
//! sections fall back to the values below.

use ke_common::MetricKind;
use ke_math::Mat2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CONFIG_SCHEMA_VERSION;

fn default_schema_version() -> String {
    CONFIG_SCHEMA_VERSION.to_string()
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Length of one model period in seconds. Trend is expressed per period
    /// and forecast horizons count periods.
    pub period_seconds: u64,

    pub metrics: MetricProfiles,
    pub fusion: FusionConfig,
    pub anomaly: AnomalyConfig,
    pub forecast: ForecastConfig,
    pub calibration: CalibrationConfig,
    pub store: StoreConfig,
    pub numerics: NumericsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            period_seconds: 86_400,
            metrics: MetricProfiles::default(),
            fusion: FusionConfig::default(),
            anomaly: AnomalyConfig::default(),
            forecast: ForecastConfig::default(),
            calibration: CalibrationConfig::default(),
            store: StoreConfig::default(),
            numerics: NumericsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn profile(&self, metric: MetricKind) -> &MetricProfile {
        self.metrics.get(metric)
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load from TOML string.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Noise and staleness parameters for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricProfile {
    /// `scale_for_metric`: variance of a zero-confidence reading, in the
    /// metric's own units squared (ratio metrics in `[0, 1]` space).
    pub measurement_scale: f64,
    /// Process noise Q per period, rows `[value, trend]`.
    #[schemars(with = "[[f64; 2]; 2]")]
    pub process_noise: Mat2,
    /// Trend variance used when a filter is initialized.
    pub initial_trend_variance: f64,
    /// Observations older than this are excluded from fusion.
    pub staleness_seconds: u64,
    /// Multiplier on the fused variance when seeding from a first observation.
    pub seed_variance_multiplier: f64,
}

impl MetricProfile {
    /// Currency metric: `sd` is the zero-confidence standard deviation and
    /// `drift` the per-period standard deviation of value changes.
    fn currency(sd: f64, drift: f64, staleness_seconds: u64) -> Self {
        let q_value = drift * drift;
        Self {
            measurement_scale: sd * sd,
            process_noise: Mat2::diag(q_value, q_value * 0.01),
            initial_trend_variance: q_value,
            staleness_seconds,
            seed_variance_multiplier: 4.0,
        }
    }

    fn ratio(sd: f64, drift: f64) -> Self {
        let q_value = drift * drift;
        Self {
            measurement_scale: sd * sd,
            process_noise: Mat2::diag(q_value, q_value * 0.01),
            initial_trend_variance: q_value,
            staleness_seconds: 7 * 86_400,
            seed_variance_multiplier: 4.0,
        }
    }
}

/// One profile per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MetricProfiles {
    pub mrr: MetricProfile,
    pub arr: MetricProfile,
    pub cac: MetricProfile,
    pub ltv: MetricProfile,
    pub churn: MetricProfile,
    pub conversion: MetricProfile,
}

impl Default for MetricProfiles {
    fn default() -> Self {
        Self {
            mrr: MetricProfile::currency(10_000.0, 500.0, 2 * 86_400),
            arr: MetricProfile::currency(120_000.0, 6_000.0, 2 * 86_400),
            cac: MetricProfile::currency(50.0, 5.0, 7 * 86_400),
            ltv: MetricProfile::currency(500.0, 50.0, 7 * 86_400),
            churn: MetricProfile::ratio(0.01, 0.001),
            conversion: MetricProfile::ratio(0.01, 0.001),
        }
    }
}

impl MetricProfiles {
    pub fn get(&self, metric: MetricKind) -> &MetricProfile {
        match metric {
            MetricKind::Mrr => &self.mrr,
            MetricKind::Arr => &self.arr,
            MetricKind::Cac => &self.cac,
            MetricKind::Ltv => &self.ltv,
            MetricKind::Churn => &self.churn,
            MetricKind::Conversion => &self.conversion,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, &MetricProfile)> {
        MetricKind::ALL.into_iter().map(move |m| (m, self.get(m)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FusionConfig {
    /// Floor on per-source variance as a fraction of `measurement_scale`, so
    /// a confidence of exactly 1 never yields zero variance.
    pub min_variance_fraction: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_variance_fraction: 1e-6,
        }
    }
}

/// Thresholds on |normalized residual|, in standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Disabled unless set; must stay below `medium_sigma`.
    pub low_sigma: Option<f64>,
    pub medium_sigma: f64,
    /// Disabled unless set, so everything between medium and severe is Medium.
    pub high_sigma: Option<f64>,
    pub severe_sigma: f64,
    /// Residuals at or beyond this flag the attributed source for review.
    pub downweight_sigma: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            low_sigma: None,
            medium_sigma: 2.5,
            high_sigma: None,
            severe_sigma: 4.0,
            downweight_sigma: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ForecastConfig {
    pub default_horizon: u32,
    pub max_horizon: u32,
    /// Per-period exponential decay of `model_confidence`; must be positive.
    pub confidence_decay: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            default_horizon: 30,
            max_horizon: 365,
            confidence_decay: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Number of most recent innovations evaluated.
    pub window: usize,
    /// Minimum innovations before a verdict other than insufficient_data.
    pub min_samples: usize,
    pub tolerance_low: f64,
    pub tolerance_high: f64,
    /// Clip range for recommended Q/R scale factors.
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window: 90,
            min_samples: 10,
            tolerance_low: 0.5,
            tolerance_high: 2.0,
            min_scale: 0.25,
            max_scale: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    pub innovation_retention: usize,
    pub snapshot_retention: usize,
    pub anomaly_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            innovation_retention: 365,
            snapshot_retention: 100,
            anomaly_retention: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NumericsConfig {
    /// Lower clamp on the innovation covariance S.
    pub min_innovation_variance: f64,
    /// Covariance eigenvalues are raised to at least this value.
    pub eigenvalue_floor: f64,
}

impl Default for NumericsConfig {
    fn default() -> Self {
        Self {
            min_innovation_variance: 1e-12,
            eigenvalue_floor: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_metric() {
        let config = EngineConfig::default();
        let metrics: Vec<_> = config.metrics.iter().map(|(m, _)| m).collect();
        assert_eq!(metrics, MetricKind::ALL.to_vec());
        assert!(config.profile(MetricKind::Mrr).measurement_scale > 1e6);
        assert!(config.profile(MetricKind::Churn).measurement_scale < 1e-2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"period_seconds": 3600}"#).unwrap();
        assert_eq!(config.period_seconds, 3600);
        assert_eq!(config.anomaly, AnomalyConfig::default());
        assert_eq!(config.schema_version, CONFIG_SCHEMA_VERSION);
    }

    #[test]
    fn test_toml_overrides_nested_section() {
        let config = EngineConfig::from_toml(
            r#"
            [anomaly]
            medium_sigma = 3.0
            high_sigma = 4.0
            severe_sigma = 5.0
            downweight_sigma = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.anomaly.medium_sigma, 3.0);
        assert_eq!(config.anomaly.low_sigma, None);
        assert_eq!(config.anomaly.high_sigma, Some(4.0));
        assert_eq!(config.forecast, ForecastConfig::default());
    }

    #[test]
    fn test_metric_profile_override() {
        let config = EngineConfig::from_json(
            r#"{"metrics": {"cac": {
                "measurement_scale": 100.0,
                "process_noise": [[4.0, 0.0], [0.0, 0.04]],
                "initial_trend_variance": 4.0,
                "staleness_seconds": 60,
                "seed_variance_multiplier": 2.0
            }}}"#,
        )
        .unwrap();
        assert_eq!(config.profile(MetricKind::Cac).staleness_seconds, 60);
        assert_eq!(
            config.profile(MetricKind::Mrr),
            &MetricProfiles::default().mrr
        );
    }
}
