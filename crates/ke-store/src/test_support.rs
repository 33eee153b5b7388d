//! Fixtures shared by backend tests.

use chrono::{DateTime, TimeZone, Utc};
use ke_common::{
    Anomaly, AnomalyStatus, FilterPhase, Forecast, Innovation, MetricKey, MetricKind, MetricState,
    RegistrySnapshot, Severity, SourceDescriptor, SourceId, TenantId,
};
use ke_math::Mat2;
use std::collections::BTreeMap;
use uuid::Uuid;

pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day.clamp(1, 28), 0, 0, 0)
        .single()
        .unwrap()
}

pub fn key() -> MetricKey {
    MetricKey::new(TenantId::parse("acme").unwrap(), MetricKind::Mrr)
}

pub fn state(cycle: u64, model_version: u64) -> MetricState {
    MetricState {
        schema_version: ke_common::SCHEMA_VERSION.to_string(),
        tenant: key().tenant,
        metric: MetricKind::Mrr,
        state_vector: [850_000.0, 100.0],
        covariance_matrix: Mat2::diag(10_000.0, 25.0),
        process_noise: Mat2::diag(250_000.0, 2_500.0),
        last_updated: at(cycle as u32 + 1),
        model_version,
        phase: if cycle == 0 {
            FilterPhase::Initialized
        } else {
            FilterPhase::Updated
        },
        cycle,
        last_gain: None,
        pending_periods: 0.0,
        anchor: None,
        source_noise_scale: BTreeMap::new(),
    }
}

pub fn innovation(cycle: u64, z: f64) -> Innovation {
    Innovation {
        cycle,
        timestamp: at(cycle as u32),
        predicted_value: 850_000.0,
        fused_value: 850_000.0 + z * 100.0,
        residual: z * 100.0,
        innovation_variance: 10_000.0,
        normalized_residual: z,
        source_id: Some(SourceId::from("stripe")),
        gain: 0.5,
        signal_to_noise_ratio: 1.0,
    }
}

pub fn anomaly(cycle: u64) -> Anomaly {
    Anomaly {
        id: Uuid::new_v4(),
        tenant: key().tenant,
        metric: MetricKind::Mrr,
        innovation_ref: cycle,
        detected_at: at(cycle as u32),
        severity: Severity::Medium,
        normalized_residual: 3.0,
        observed_value: 850_300.0,
        expected_lower: 849_750.0,
        expected_upper: 850_250.0,
        classification_hint: "spike".to_string(),
        downweight_candidate: None,
        status: AnomalyStatus::Open,
        resolved_at: None,
    }
}

pub fn forecast(day: u32) -> Forecast {
    Forecast {
        metric: MetricKind::Mrr,
        horizon_day: day,
        predicted_value: 850_000.0 + 100.0 * day as f64,
        ci68_lower: 849_000.0,
        ci68_upper: 851_000.0,
        ci95_lower: 848_000.0,
        ci95_upper: 852_000.0,
        model_confidence: 0.9,
    }
}

pub fn registry() -> RegistrySnapshot {
    RegistrySnapshot {
        sources: vec![SourceDescriptor {
            source_id: SourceId::from("stripe"),
            metric: MetricKind::Mrr,
            base_confidence: 0.95,
            latency_seconds: 60,
            supported_metrics: vec![MetricKind::Mrr],
            registered_at: at(1),
        }],
        pending_reviews: Vec::new(),
    }
}
