//! Observation normalizer and multi-source fusion.
//!
//! Raw readings are brought into the metric's working space (ratio metrics
//! in `[0, 1]`, magnitude metrics in currency), assigned a variance from
//! their effective confidence, filtered for staleness, and fused by
//! inverse-variance weighting into one [`FusedMeasurement`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ke_common::{
    Error, FusedMeasurement, MetricKind, MetricState, Observation, Result, SourceId, SourceWeight,
};
use ke_config::EngineConfig;

use crate::registry::SourceRegistry;

/// One reading ready for fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedReading {
    pub source_id: SourceId,
    pub value: f64,
    pub variance: f64,
    pub timestamp: DateTime<Utc>,
}

/// Why an observation was left out of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExcludedObservation {
    pub source_id: SourceId,
    pub age_seconds: i64,
    pub reason: String,
}

/// Outcome of normalizing and fusing one cycle's observations.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionReport {
    pub measurement: FusedMeasurement,
    pub excluded: Vec<ExcludedObservation>,
    pub warnings: Vec<String>,
    /// Contributing source farthest from the fused value.
    pub most_deviant: Option<SourceId>,
}

/// Bring a raw value into the metric's working space.
///
/// Ratio metrics accept `[0, 1]` directly and percentages in `(1, 100]`.
pub fn normalize_value(metric: MetricKind, raw: f64) -> Result<f64> {
    if !raw.is_finite() {
        return Err(Error::InvalidInput(format!(
            "{metric} observation is not finite: {raw}"
        )));
    }
    if !metric.is_ratio() {
        return Ok(raw);
    }
    if raw < 0.0 {
        return Err(Error::InvalidInput(format!(
            "{metric} is a ratio and cannot be negative: {raw}"
        )));
    }
    if raw <= 1.0 {
        Ok(raw)
    } else if raw <= 100.0 {
        Ok(raw / 100.0)
    } else {
        Err(Error::InvalidInput(format!(
            "{metric} is a ratio; {raw} exceeds 100%"
        )))
    }
}

/// Fuse readings by inverse-variance weighting.
///
/// A single reading passes through untouched.
pub fn fuse_inverse_variance(
    metric: MetricKind,
    readings: &[WeightedReading],
) -> Result<FusedMeasurement> {
    let newest = readings
        .iter()
        .map(|r| r.timestamp)
        .max()
        .ok_or(Error::NoObservations { metric })?;

    if let [only] = readings {
        return Ok(FusedMeasurement {
            metric,
            value: only.value,
            variance: only.variance,
            timestamp: only.timestamp,
            contributions: vec![SourceWeight {
                source_id: only.source_id.clone(),
                value: only.value,
                variance: only.variance,
                weight: 1.0,
            }],
        });
    }

    let mut precision = 0.0;
    let mut weighted_sum = 0.0;
    for reading in readings {
        if !(reading.variance.is_finite() && reading.variance > 0.0) {
            return Err(Error::InvalidInput(format!(
                "source {} has non-positive variance {}",
                reading.source_id, reading.variance
            )));
        }
        precision += 1.0 / reading.variance;
        weighted_sum += reading.value / reading.variance;
    }

    let contributions = readings
        .iter()
        .map(|r| SourceWeight {
            source_id: r.source_id.clone(),
            value: r.value,
            variance: r.variance,
            weight: (1.0 / r.variance) / precision,
        })
        .collect();

    Ok(FusedMeasurement {
        metric,
        value: weighted_sum / precision,
        variance: 1.0 / precision,
        timestamp: newest,
        contributions,
    })
}

/// Turns raw observations into a fused measurement for one metric.
pub struct Normalizer<'a> {
    config: &'a EngineConfig,
    registry: &'a SourceRegistry,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a EngineConfig, registry: &'a SourceRegistry) -> Self {
        Self { config, registry }
    }

    /// `σ² = (1 − c)·scale`, floored so full confidence never yields zero,
    /// then scaled by the source's calibrated R multiplier.
    pub fn source_variance(&self, metric: MetricKind, confidence: f64, noise_scale: f64) -> f64 {
        let scale = self.config.profile(metric).measurement_scale;
        let floor = self.config.fusion.min_variance_fraction * scale;
        ((1.0 - confidence) * scale).max(floor) * noise_scale
    }

    /// Normalize, filter and fuse `observations` as of `as_of`.
    ///
    /// `state` supplies per-source calibrated noise multipliers when present.
    pub fn fuse(
        &self,
        metric: MetricKind,
        observations: &[Observation],
        state: Option<&MetricState>,
        as_of: DateTime<Utc>,
    ) -> Result<FusionReport> {
        let staleness = self.config.profile(metric).staleness_seconds as i64;
        let mut readings = Vec::with_capacity(observations.len());
        let mut excluded = Vec::new();
        let mut warnings = Vec::new();

        for obs in observations {
            if obs.metric != metric {
                return Err(Error::InvalidInput(format!(
                    "observation from {} is for {}, cycle is for {metric}",
                    obs.source_id, obs.metric
                )));
            }
            let declared = obs.declared_confidence;
            if !(declared.is_finite() && declared > 0.0 && declared <= 1.0) {
                return Err(Error::InvalidInput(format!(
                    "confidence of {} must be in (0, 1], got {declared}",
                    obs.source_id
                )));
            }
            let value = normalize_value(metric, obs.raw_value)?;

            let age = (as_of - obs.timestamp).num_seconds().max(0);
            if age > staleness {
                warn!(
                    source_id = %obs.source_id,
                    %metric,
                    age_seconds = age,
                    staleness_seconds = staleness,
                    "stale observation excluded"
                );
                excluded.push(ExcludedObservation {
                    source_id: obs.source_id.clone(),
                    age_seconds: age,
                    reason: format!("older than {staleness}s staleness threshold"),
                });
                continue;
            }
            if let Some(descriptor) = self.registry.lookup(&obs.source_id, metric) {
                if age as u64 > descriptor.latency_seconds {
                    warnings.push(format!(
                        "{} reading is {age}s old, beyond its declared {}s latency",
                        obs.source_id, descriptor.latency_seconds
                    ));
                }
            }

            let confidence = self.registry.effective_confidence(obs);
            let noise_scale = state.map_or(1.0, |s| s.noise_scale_for(&obs.source_id));
            readings.push(WeightedReading {
                source_id: obs.source_id.clone(),
                value,
                variance: self.source_variance(metric, confidence, noise_scale),
                timestamp: obs.timestamp,
            });
        }

        let measurement = fuse_inverse_variance(metric, &readings)?;
        let most_deviant = if measurement.contributions.len() > 1 {
            measurement.most_deviant_source(measurement.value).cloned()
        } else {
            None
        };
        debug!(
            %metric,
            sources = measurement.contributions.len(),
            excluded = excluded.len(),
            fused_value = measurement.value,
            fused_variance = measurement.variance,
            "observations fused"
        );
        Ok(FusionReport {
            measurement,
            excluded,
            warnings,
            most_deviant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn reading(source: &str, value: f64, variance: f64) -> WeightedReading {
        WeightedReading {
            source_id: source.into(),
            value,
            variance,
            timestamp: at(),
        }
    }

    fn obs(source: &str, metric: MetricKind, value: f64, confidence: f64) -> Observation {
        Observation {
            source_id: source.into(),
            metric,
            raw_value: value,
            timestamp: at(),
            declared_confidence: confidence,
        }
    }

    #[test]
    fn test_equal_variance_is_midpoint() {
        let fused = fuse_inverse_variance(
            MetricKind::Mrr,
            &[reading("a", 100.0, 4.0), reading("b", 200.0, 4.0)],
        )
        .unwrap();
        assert!((fused.value - 150.0).abs() < 1e-9);
        assert!(fused.variance < 4.0);
        assert!((fused.variance - 2.0).abs() < 1e-12);
        let total: f64 = fused.contributions.iter().map(|c| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_reading_is_identity() {
        let fused =
            fuse_inverse_variance(MetricKind::Cac, &[reading("a", 123.456, 0.3)]).unwrap();
        assert_eq!(fused.value, 123.456);
        assert_eq!(fused.variance, 0.3);
    }

    #[test]
    fn test_empty_is_no_observations() {
        assert!(matches!(
            fuse_inverse_variance(MetricKind::Ltv, &[]),
            Err(Error::NoObservations {
                metric: MetricKind::Ltv
            })
        ));
    }

    #[test]
    fn test_precise_source_dominates() {
        let fused = fuse_inverse_variance(
            MetricKind::Mrr,
            &[reading("tight", 100.0, 1.0), reading("loose", 200.0, 100.0)],
        )
        .unwrap();
        assert!((fused.value - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_normalize_ratio_percentages() {
        assert_eq!(normalize_value(MetricKind::Churn, 0.05).unwrap(), 0.05);
        assert!((normalize_value(MetricKind::Churn, 5.0).unwrap() - 0.05).abs() < 1e-12);
        assert_eq!(normalize_value(MetricKind::Conversion, 100.0).unwrap(), 1.0);
        assert!(normalize_value(MetricKind::Churn, -0.1).is_err());
        assert!(normalize_value(MetricKind::Churn, 150.0).is_err());
        assert!(normalize_value(MetricKind::Mrr, f64::NAN).is_err());
        assert_eq!(normalize_value(MetricKind::Mrr, 850_000.0).unwrap(), 850_000.0);
    }

    #[test]
    fn test_full_confidence_is_floored() {
        let config = EngineConfig::default();
        let registry = SourceRegistry::new();
        let normalizer = Normalizer::new(&config, &registry);
        let v = normalizer.source_variance(MetricKind::Mrr, 1.0, 1.0);
        assert!(v > 0.0);
        let scale = config.profile(MetricKind::Mrr).measurement_scale;
        assert_eq!(v, scale * config.fusion.min_variance_fraction);
    }

    #[test]
    fn test_full_confidence_still_blends() {
        let config = EngineConfig::default();
        let registry = SourceRegistry::new();
        let report = Normalizer::new(&config, &registry)
            .fuse(
                MetricKind::Mrr,
                &[
                    obs("ledger", MetricKind::Mrr, 100.0, 1.0),
                    obs("crm", MetricKind::Mrr, 200.0, 0.5),
                ],
                None,
                at(),
            )
            .unwrap();
        let v = report.measurement.value;
        assert!(v.is_finite() && v > 100.0 && v < 200.0);
        assert_eq!(report.most_deviant, Some("crm".into()));
    }

    #[test]
    fn test_stale_observations_are_excluded() {
        let config = EngineConfig::default();
        let registry = SourceRegistry::new();
        let mut old = obs("warehouse", MetricKind::Mrr, 1.0, 0.9);
        old.timestamp = at() - Duration::days(30);
        let fresh = obs("stripe", MetricKind::Mrr, 2.0, 0.9);
        let report = Normalizer::new(&config, &registry)
            .fuse(MetricKind::Mrr, &[old.clone(), fresh], None, at())
            .unwrap();
        assert_eq!(report.measurement.contributions.len(), 1);
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].source_id, "warehouse".into());

        let err = Normalizer::new(&config, &registry)
            .fuse(MetricKind::Mrr, &[old], None, at())
            .unwrap_err();
        assert!(matches!(err, Error::NoObservations { .. }));
    }

    #[test]
    fn test_latency_overrun_warns_but_keeps() {
        let config = EngineConfig::default();
        let mut registry = SourceRegistry::new();
        registry
            .register("stripe".into(), MetricKind::Mrr, 0.95, 60)
            .unwrap();
        let mut late = obs("stripe", MetricKind::Mrr, 1.0, 0.9);
        late.timestamp = at() - Duration::hours(1);
        let report = Normalizer::new(&config, &registry)
            .fuse(MetricKind::Mrr, &[late], None, at())
            .unwrap();
        assert_eq!(report.measurement.contributions.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_rejects_mismatched_metric_and_bad_confidence() {
        let config = EngineConfig::default();
        let registry = SourceRegistry::new();
        let normalizer = Normalizer::new(&config, &registry);
        assert!(matches!(
            normalizer.fuse(
                MetricKind::Mrr,
                &[obs("a", MetricKind::Arr, 1.0, 0.5)],
                None,
                at()
            ),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            normalizer.fuse(
                MetricKind::Mrr,
                &[obs("a", MetricKind::Mrr, 1.0, 0.0)],
                None,
                at()
            ),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_calibrated_noise_scale_applies() {
        let config = EngineConfig::default();
        let registry = SourceRegistry::new();
        let normalizer = Normalizer::new(&config, &registry);
        let base = normalizer.source_variance(MetricKind::Cac, 0.5, 1.0);
        assert_eq!(normalizer.source_variance(MetricKind::Cac, 0.5, 2.0), base * 2.0);
    }
}
