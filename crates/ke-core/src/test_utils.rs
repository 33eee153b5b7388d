//! Seeded synthetic observation streams for tests and benches.
//!
//! Each synthetic source reports the true value plus Gaussian noise whose
//! variance matches what the normalizer assigns to its confidence, so a
//! correctly tuned filter sees unit-variance normalized residuals.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ke_common::MetricKind;
use ke_config::EngineConfig;

use crate::api::{EstimateRequest, ObservationInput};

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub source_id: String,
    pub confidence: f64,
    /// Constant offset added to every reading.
    pub bias: f64,
}

impl SyntheticSource {
    pub fn new(source_id: &str, confidence: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            confidence,
            bias: 0.0,
        }
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }
}

/// A metric following a linear trend, observed daily by several sources.
#[derive(Debug, Clone)]
pub struct MetricScenario {
    pub tenant: Option<String>,
    pub metric: MetricKind,
    pub start_value: f64,
    pub daily_growth: f64,
    pub sources: Vec<SyntheticSource>,
    pub forecast_horizon: i64,
}

impl MetricScenario {
    /// MRR around 850k observed by billing, CRM and accounting.
    pub fn mrr() -> Self {
        Self {
            tenant: None,
            metric: MetricKind::Mrr,
            start_value: 850_000.0,
            daily_growth: 500.0,
            sources: vec![
                SyntheticSource::new("stripe", 0.95),
                SyntheticSource::new("salesforce", 0.80),
                SyntheticSource::new("quickbooks", 0.98),
            ],
            forecast_horizon: 30,
        }
    }

    /// Monthly churn around 3% from two sources.
    pub fn churn() -> Self {
        Self {
            tenant: None,
            metric: MetricKind::Churn,
            start_value: 0.03,
            daily_growth: 0.0,
            sources: vec![
                SyntheticSource::new("chargebee", 0.9),
                SyntheticSource::new("warehouse", 0.7),
            ],
            forecast_horizon: 14,
        }
    }

    pub fn truth(&self, day: u32) -> f64 {
        self.start_value + self.daily_growth * f64::from(day)
    }

    /// One request per day starting at `start`, reproducible for a seed.
    pub fn requests(
        &self,
        config: &EngineConfig,
        seed: u64,
        days: u32,
        start: DateTime<Utc>,
    ) -> Vec<EstimateRequest> {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = config.profile(self.metric).measurement_scale;
        (0..days)
            .map(|day| {
                let truth = self.truth(day);
                let observations = self
                    .sources
                    .iter()
                    .map(|source| {
                        let sd = ((1.0 - source.confidence) * scale).sqrt();
                        let mut value = truth + source.bias + sd * standard_normal(&mut rng);
                        if self.metric.is_ratio() {
                            value = value.clamp(0.0, 1.0);
                        }
                        ObservationInput {
                            source_id: source.source_id.clone(),
                            metric: None,
                            value,
                            confidence: source.confidence,
                            timestamp: None,
                        }
                    })
                    .collect();
                EstimateRequest {
                    tenant: self.tenant.clone(),
                    metric: self.metric,
                    observations,
                    forecast_horizon: Some(self.forecast_horizon),
                    as_of: Some(start + Duration::days(i64::from(day))),
                }
            })
            .collect()
    }
}

/// Box-Muller draw from N(0, 1).
pub fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
