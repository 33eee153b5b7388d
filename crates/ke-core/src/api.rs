//! Request/response contract of the invocation surface.
//!
//! Field names of [`EstimateResponse`] up to `anomalies` match what the
//! metric-estimation dashboard consumes; everything after them is additive.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ke_common::{
    Anomaly, DownweightReview, Error, Forecast, FusedMeasurement, Innovation, MetricKind,
    MetricState, Observation, Result, SourceId, TenantId, SCHEMA_VERSION,
};

use crate::normalize::ExcludedObservation;

/// One source reading as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObservationInput {
    pub source_id: String,
    /// Defaults to the request metric; must match it when given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricKind>,
    #[serde(alias = "raw_value")]
    pub value: f64,
    #[serde(alias = "declared_confidence")]
    pub confidence: f64,
    /// Defaults to the cycle time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Input of one estimation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EstimateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub metric: MetricKind,
    pub observations: Vec<ObservationInput>,
    /// Periods to forecast; the configured default when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_horizon: Option<i64>,
    /// Cycle time; now when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl EstimateRequest {
    pub fn new(metric: MetricKind, observations: Vec<ObservationInput>) -> Self {
        Self {
            tenant: None,
            metric,
            observations,
            forecast_horizon: None,
            as_of: None,
        }
    }

    /// Convert inputs into observations stamped at `as_of` when undated.
    pub fn to_observations(&self, as_of: DateTime<Utc>) -> Result<Vec<Observation>> {
        self.observations
            .iter()
            .map(|input| {
                let source_id = SourceId::parse(&input.source_id).ok_or_else(|| {
                    Error::InvalidInput("observation source_id must not be empty".to_string())
                })?;
                Ok(Observation {
                    source_id,
                    metric: input.metric.unwrap_or(self.metric),
                    raw_value: input.value,
                    timestamp: input.timestamp.unwrap_or(as_of),
                    declared_confidence: input.confidence,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    /// Coverage of the interval, e.g. `0.95`.
    pub level: f64,
}

/// Output of one estimation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EstimateResponse {
    pub estimated_value: f64,
    pub confidence_interval: ConfidenceInterval,
    pub trend: f64,
    pub kalman_gain: f64,
    /// Raw residual `z − H·x'` of this cycle.
    pub innovation: f64,
    pub signal_to_noise_ratio: f64,
    pub forecasts: Vec<Forecast>,
    pub anomalies: Vec<Anomaly>,

    pub schema_version: String,
    pub tenant: TenantId,
    pub metric: MetricKind,
    pub as_of: DateTime<Utc>,
    pub cycle: u64,
    pub model_version: u64,
    /// True when this cycle created the filter from its first observations.
    pub seeded: bool,
    pub normalized_innovation: f64,
    pub fused_measurement: FusedMeasurement,
    #[serde(default)]
    pub excluded_sources: Vec<ExcludedObservation>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl EstimateResponse {
    /// Plain-data view handed to a downstream insight summarizer.
    pub fn insight_payload(&self) -> InsightPayload {
        InsightPayload {
            tenant: self.tenant.clone(),
            metric: self.metric,
            as_of: self.as_of,
            estimated_value: self.estimated_value,
            confidence_interval: self.confidence_interval,
            trend: self.trend,
            kalman_gain: self.kalman_gain,
            signal_to_noise_ratio: self.signal_to_noise_ratio,
            anomalies: self.anomalies.clone(),
            forecasts: self.forecasts.clone(),
        }
    }
}

/// Numeric facts a summarizer turns into prose. The engine never depends on
/// a summarizer being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InsightPayload {
    pub tenant: TenantId,
    pub metric: MetricKind,
    pub as_of: DateTime<Utc>,
    pub estimated_value: f64,
    pub confidence_interval: ConfidenceInterval,
    pub trend: f64,
    pub kalman_gain: f64,
    pub signal_to_noise_ratio: f64,
    pub anomalies: Vec<Anomaly>,
    pub forecasts: Vec<Forecast>,
}

/// Read-only view returned by `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StateView {
    pub state: MetricState,
    pub recent_innovations: Vec<Innovation>,
    pub forecasts: Vec<Forecast>,
    pub open_anomalies: Vec<Anomaly>,
    pub snapshot_count: usize,
    pub pending_reviews: Vec<DownweightReview>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accepts_dashboard_shape() {
        let req: EstimateRequest = serde_json::from_str(
            r#"{
                "metric": "mrr",
                "observations": [
                    {"source_id": "stripe", "value": 855000, "confidence": 0.95},
                    {"source_id": "salesforce", "raw_value": 860000, "declared_confidence": 0.8}
                ],
                "forecast_horizon": 30
            }"#,
        )
        .unwrap();
        assert_eq!(req.metric, MetricKind::Mrr);
        assert_eq!(req.forecast_horizon, Some(30));
        assert_eq!(req.observations[1].value, 860_000.0);
        assert_eq!(req.observations[1].confidence, 0.8);
    }

    #[test]
    fn test_to_observations_fills_defaults() {
        let as_of = Utc::now();
        let req = EstimateRequest::new(
            MetricKind::Churn,
            vec![ObservationInput {
                source_id: "ledger".into(),
                metric: None,
                value: 2.5,
                confidence: 0.9,
                timestamp: None,
            }],
        );
        let obs = req.to_observations(as_of).unwrap();
        assert_eq!(obs[0].metric, MetricKind::Churn);
        assert_eq!(obs[0].timestamp, as_of);
        assert_eq!(obs[0].source_id, SourceId::from("ledger"));
    }

    #[test]
    fn test_to_observations_rejects_blank_source() {
        let req = EstimateRequest::new(
            MetricKind::Mrr,
            vec![ObservationInput {
                source_id: "  ".into(),
                metric: None,
                value: 1.0,
                confidence: 0.9,
                timestamp: None,
            }],
        );
        assert!(matches!(
            req.to_observations(Utc::now()),
            Err(Error::InvalidInput(_))
        ));
    }
}
