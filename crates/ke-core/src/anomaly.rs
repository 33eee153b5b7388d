//! Anomaly detector: thresholds one innovation's normalized residual.
//!
//! Stateless: the decision depends only on the latest [`Innovation`] (whose
//! `S` already carries the metric's current σ), never on history.

use chrono::Utc;
use uuid::Uuid;

use ke_common::{
    Anomaly, AnomalyStatus, DownweightReview, Innovation, MetricKind, Severity, TenantId,
};
use ke_config::AnomalyConfig;

/// Anomaly plus the down-weight review it asks for, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub anomaly: Anomaly,
    pub review: Option<DownweightReview>,
}

pub struct AnomalyDetector<'a> {
    config: &'a AnomalyConfig,
}

impl<'a> AnomalyDetector<'a> {
    pub fn new(config: &'a AnomalyConfig) -> Self {
        Self { config }
    }

    /// Severity band for `|z|`, or `None` below every threshold.
    pub fn classify(&self, normalized_residual: f64) -> Option<Severity> {
        let z = normalized_residual.abs();
        if !z.is_finite() {
            return Some(Severity::Severe);
        }
        if z >= self.config.severe_sigma {
            Some(Severity::Severe)
        } else if self.config.high_sigma.is_some_and(|high| z >= high) {
            Some(Severity::High)
        } else if z >= self.config.medium_sigma {
            Some(Severity::Medium)
        } else if self.config.low_sigma.is_some_and(|low| z >= low) {
            Some(Severity::Low)
        } else {
            None
        }
    }

    /// Inspect one innovation. Returns `None` when nothing crosses a threshold.
    pub fn inspect(
        &self,
        tenant: &TenantId,
        metric: MetricKind,
        innovation: &Innovation,
    ) -> Option<Detection> {
        let z = innovation.normalized_residual;
        let severity = self.classify(z)?;
        let sigma = innovation.innovation_variance.max(0.0).sqrt();
        let half_width = self.config.medium_sigma * sigma;

        let downweight_candidate = if z.abs() >= self.config.downweight_sigma {
            innovation.source_id.clone()
        } else {
            None
        };
        let direction = if innovation.residual >= 0.0 {
            "spike"
        } else {
            "drop"
        };
        let classification_hint = match downweight_candidate {
            Some(_) => format!("{direction}:source_outlier"),
            None => direction.to_string(),
        };

        let anomaly = Anomaly {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            metric,
            innovation_ref: innovation.cycle,
            detected_at: innovation.timestamp,
            severity,
            normalized_residual: z,
            observed_value: innovation.fused_value,
            expected_lower: innovation.predicted_value - half_width,
            expected_upper: innovation.predicted_value + half_width,
            classification_hint,
            downweight_candidate: downweight_candidate.clone(),
            status: AnomalyStatus::Open,
            resolved_at: None,
        };
        let review = downweight_candidate.map(|source_id| DownweightReview {
            source_id,
            metric,
            tenant: tenant.clone(),
            anomaly_id: anomaly.id,
            normalized_residual: z,
            flagged_at: Utc::now(),
        });
        Some(Detection { anomaly, review })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn innovation(z: f64) -> Innovation {
        Innovation {
            cycle: 7,
            timestamp: Utc::now(),
            predicted_value: 100.0,
            fused_value: 100.0 + z * 2.0,
            residual: z * 2.0,
            innovation_variance: 4.0,
            normalized_residual: z,
            source_id: Some("salesforce".into()),
            gain: 0.5,
            signal_to_noise_ratio: 1.0,
        }
    }

    fn inspect(config: &AnomalyConfig, z: f64) -> Option<Detection> {
        AnomalyDetector::new(config).inspect(
            &TenantId::default_tenant(),
            MetricKind::Mrr,
            &innovation(z),
        )
    }

    #[test]
    fn test_one_sigma_is_quiet() {
        assert!(inspect(&AnomalyConfig::default(), 1.0).is_none());
        assert!(inspect(&AnomalyConfig::default(), -2.4).is_none());
    }

    #[test]
    fn test_three_sigma_is_medium() {
        let d = inspect(&AnomalyConfig::default(), 3.0).unwrap();
        assert_eq!(d.anomaly.severity, Severity::Medium);
        assert!(d.review.is_none());
        assert_eq!(d.anomaly.classification_hint, "spike");
        assert_eq!(d.anomaly.innovation_ref, 7);
        assert_eq!(d.anomaly.status, AnomalyStatus::Open);
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let config = AnomalyConfig::default();
        let detector = AnomalyDetector::new(&config);
        assert_eq!(detector.classify(2.5), Some(Severity::Medium));
        assert_eq!(detector.classify(-4.0), Some(Severity::Severe));
        assert_eq!(detector.classify(f64::INFINITY), Some(Severity::Severe));
    }

    #[test]
    fn test_between_medium_and_severe_stays_medium() {
        let config = AnomalyConfig::default();
        let detector = AnomalyDetector::new(&config);
        assert_eq!(detector.classify(3.5), Some(Severity::Medium));
        assert_eq!(detector.classify(-3.7), Some(Severity::Medium));
        assert_eq!(detector.classify(3.99), Some(Severity::Medium));
        let d = inspect(&config, 3.7).unwrap();
        assert_eq!(d.anomaly.severity, Severity::Medium);
        assert!(d.review.is_none());
    }

    #[test]
    fn test_high_band_only_when_configured() {
        let config = AnomalyConfig {
            high_sigma: Some(3.5),
            ..AnomalyConfig::default()
        };
        let detector = AnomalyDetector::new(&config);
        assert_eq!(detector.classify(3.4), Some(Severity::Medium));
        assert_eq!(detector.classify(3.7), Some(Severity::High));
        assert_eq!(detector.classify(4.0), Some(Severity::Severe));
    }

    #[test]
    fn test_five_sigma_is_severe_and_flags_source() {
        let d = inspect(&AnomalyConfig::default(), 5.0).unwrap();
        assert_eq!(d.anomaly.severity, Severity::Severe);
        assert_eq!(d.anomaly.downweight_candidate, Some("salesforce".into()));
        assert_eq!(d.anomaly.classification_hint, "spike:source_outlier");
        let review = d.review.unwrap();
        assert_eq!(review.anomaly_id, d.anomaly.id);
        assert_eq!(review.source_id, "salesforce".into());
    }

    #[test]
    fn test_drop_and_expected_range() {
        let d = inspect(&AnomalyConfig::default(), -3.0).unwrap();
        assert_eq!(d.anomaly.classification_hint, "drop");
        assert_eq!(d.anomaly.expected_lower, 95.0);
        assert_eq!(d.anomaly.expected_upper, 105.0);
        assert_eq!(d.anomaly.observed_value, 94.0);
    }

    #[test]
    fn test_low_band_only_when_configured() {
        let config = AnomalyConfig {
            low_sigma: Some(2.0),
            ..AnomalyConfig::default()
        };
        assert_eq!(
            inspect(&config, 2.2).map(|d| d.anomaly.severity),
            Some(Severity::Low)
        );
        assert!(inspect(&AnomalyConfig::default(), 2.2).is_none());
    }
}
