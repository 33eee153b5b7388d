//! Semantic validation of engine configuration.
//!
//! Deserialization guarantees shape; this module checks the numeric
//! relationships the engine relies on (positive scales, PSD process noise,
//! ordered thresholds).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::engine::{EngineConfig, MetricProfile};

/// A single semantic problem, addressed by a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Join all errors into one line, for error messages.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn validate_profile(result: &mut ValidationResult, name: &str, profile: &MetricProfile) {
    let base = format!("metrics.{name}");
    if !positive(profile.measurement_scale) {
        result.push(
            format!("{base}.measurement_scale"),
            "must be finite and > 0",
        );
    }
    let q = profile.process_noise;
    if !q.is_finite() {
        result.push(format!("{base}.process_noise"), "must be finite");
    } else {
        if !q.is_symmetric(ke_math::SYMMETRY_TOLERANCE) {
            result.push(format!("{base}.process_noise"), "must be symmetric");
        }
        if !q.is_psd(1e-12) {
            result.push(
                format!("{base}.process_noise"),
                "must be positive semi-definite",
            );
        }
    }
    if !(profile.initial_trend_variance.is_finite() && profile.initial_trend_variance >= 0.0) {
        result.push(
            format!("{base}.initial_trend_variance"),
            "must be finite and >= 0",
        );
    }
    if profile.staleness_seconds == 0 {
        result.push(format!("{base}.staleness_seconds"), "must be > 0");
    }
    if !(profile.seed_variance_multiplier.is_finite() && profile.seed_variance_multiplier >= 1.0) {
        result.push(
            format!("{base}.seed_variance_multiplier"),
            "must be finite and >= 1",
        );
    }
}

/// Validate an engine configuration, collecting every problem found.
pub fn validate(config: &EngineConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !ke_common::schema::is_compatible(&config.schema_version) {
        result.push(
            "schema_version",
            format!("unsupported version {}", config.schema_version),
        );
    }
    if config.period_seconds == 0 {
        result.push("period_seconds", "must be > 0");
    }

    for (metric, profile) in config.metrics.iter() {
        validate_profile(&mut result, metric.as_str(), profile);
    }

    let fraction = config.fusion.min_variance_fraction;
    if !(positive(fraction) && fraction < 1.0) {
        result.push("fusion.min_variance_fraction", "must be in (0, 1)");
    }

    let anomaly = &config.anomaly;
    if !positive(anomaly.medium_sigma) {
        result.push("anomaly.medium_sigma", "must be finite and > 0");
    }
    if let Some(low) = anomaly.low_sigma {
        if !(positive(low) && low < anomaly.medium_sigma) {
            result.push("anomaly.low_sigma", "must be > 0 and below medium_sigma");
        }
    }
    if anomaly.medium_sigma > anomaly.severe_sigma {
        result.push("anomaly", "thresholds must satisfy medium_sigma <= severe_sigma");
    }
    if let Some(high) = anomaly.high_sigma {
        if !(anomaly.medium_sigma <= high && high <= anomaly.severe_sigma) {
            result.push(
                "anomaly.high_sigma",
                "must lie between medium_sigma and severe_sigma",
            );
        }
    }
    if !positive(anomaly.downweight_sigma) {
        result.push("anomaly.downweight_sigma", "must be finite and > 0");
    }

    let forecast = &config.forecast;
    if forecast.max_horizon == 0 {
        result.push("forecast.max_horizon", "must be > 0");
    }
    if forecast.default_horizon == 0 || forecast.default_horizon > forecast.max_horizon {
        result.push(
            "forecast.default_horizon",
            "must be within 1..=max_horizon",
        );
    }
    if !positive(forecast.confidence_decay) {
        result.push("forecast.confidence_decay", "must be finite and > 0");
    }

    let cal = &config.calibration;
    if cal.window == 0 {
        result.push("calibration.window", "must be > 0");
    }
    if cal.min_samples < 2 || cal.min_samples > cal.window {
        result.push("calibration.min_samples", "must be within 2..=window");
    }
    if !(positive(cal.tolerance_low) && cal.tolerance_low < 1.0 && cal.tolerance_high > 1.0) {
        result.push(
            "calibration.tolerance_low",
            "tolerance band must contain 1.0 (0 < low < 1 < high)",
        );
    }
    if !(positive(cal.min_scale) && cal.min_scale <= 1.0 && cal.max_scale >= 1.0) {
        result.push(
            "calibration.min_scale",
            "scale clip must contain 1.0 (0 < min_scale <= 1 <= max_scale)",
        );
    }

    let store = &config.store;
    if store.innovation_retention < cal.window {
        result.push(
            "store.innovation_retention",
            "must retain at least calibration.window innovations",
        );
    }
    if store.snapshot_retention == 0 {
        result.push("store.snapshot_retention", "must be > 0");
    }

    let numerics = &config.numerics;
    if !positive(numerics.min_innovation_variance) {
        result.push("numerics.min_innovation_variance", "must be finite and > 0");
    }
    if !(numerics.eigenvalue_floor.is_finite() && numerics.eigenvalue_floor >= 0.0) {
        result.push("numerics.eigenvalue_floor", "must be finite and >= 0");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ke_math::Mat2;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate(&EngineConfig::default());
        assert!(result.is_ok(), "{}", result.summary());
    }

    #[test]
    fn test_rejects_non_psd_process_noise() {
        let mut config = EngineConfig::default();
        config.metrics.mrr.process_noise = Mat2::new(1.0, 2.0, 2.0, 1.0);
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.path == "metrics.mrr.process_noise"));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = EngineConfig::default();
        config.anomaly.high_sigma = Some(5.0);
        config.anomaly.severe_sigma = 4.0;
        assert!(!validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_low_above_medium() {
        let mut config = EngineConfig::default();
        config.anomaly.low_sigma = Some(3.0);
        let result = validate(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "anomaly.low_sigma");
    }

    #[test]
    fn test_rejects_inverted_tolerance() {
        let mut config = EngineConfig::default();
        config.calibration.tolerance_low = 2.5;
        assert!(!validate(&config).is_ok());
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut config = EngineConfig::default();
        config.period_seconds = 0;
        config.metrics.churn.measurement_scale = -1.0;
        config.forecast.confidence_decay = 0.0;
        let result = validate(&config);
        assert_eq!(result.errors.len(), 3, "{}", result.summary());
    }
}
