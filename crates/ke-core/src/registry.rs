//! Source registry: declared trust and latency per (source, metric).
//!
//! The Kalman core never hard-codes source trust; it asks the registry.
//! Sources the anomaly detector flags for down-weighting land in a review
//! queue here and stay there until someone applies or dismisses the review.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info};

use ke_common::{
    DownweightReview, Error, MetricKind, Observation, RegistrySnapshot, Result, SourceDescriptor,
    SourceId,
};

fn validate_confidence(confidence: f64) -> Result<()> {
    if !(confidence.is_finite() && confidence > 0.0 && confidence <= 1.0) {
        return Err(Error::InvalidConfiguration(format!(
            "base_confidence must be in (0, 1], got {confidence}"
        )));
    }
    Ok(())
}

/// Table of registered sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: BTreeMap<(SourceId, MetricKind), SourceDescriptor>,
    pending_reviews: Vec<DownweightReview>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot, rejecting invalid descriptors.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for descriptor in snapshot.sources {
            validate_confidence(descriptor.base_confidence)?;
            entries.insert(
                (descriptor.source_id.clone(), descriptor.metric),
                descriptor,
            );
        }
        Ok(Self {
            entries,
            pending_reviews: snapshot.pending_reviews,
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            sources: self.entries.values().cloned().collect(),
            pending_reviews: self.pending_reviews.clone(),
        }
    }

    /// Register (or re-register) a source for a metric.
    pub fn register(
        &mut self,
        source_id: SourceId,
        metric: MetricKind,
        base_confidence: f64,
        latency_seconds: u64,
    ) -> Result<&SourceDescriptor> {
        validate_confidence(base_confidence)?;

        let mut supported: Vec<MetricKind> = self
            .entries
            .keys()
            .filter(|(id, _)| *id == source_id)
            .map(|(_, m)| *m)
            .chain(std::iter::once(metric))
            .collect();
        supported.sort();
        supported.dedup();

        for ((id, _), descriptor) in self.entries.iter_mut() {
            if *id == source_id {
                descriptor.supported_metrics = supported.clone();
            }
        }

        info!(
            source_id = %source_id,
            %metric,
            base_confidence,
            latency_seconds,
            "source registered"
        );
        let key = (source_id.clone(), metric);
        self.entries.insert(
            key.clone(),
            SourceDescriptor {
                source_id,
                metric,
                base_confidence,
                latency_seconds,
                supported_metrics: supported,
                registered_at: Utc::now(),
            },
        );
        self.entries
            .get(&key)
            .ok_or_else(|| Error::InvalidConfiguration("registry insert lost".to_string()))
    }

    pub fn describe(&self, source_id: &SourceId, metric: MetricKind) -> Result<&SourceDescriptor> {
        self.lookup(source_id, metric)
            .ok_or_else(|| Error::SourceNotFound {
                source_id: source_id.clone(),
                metric,
            })
    }

    pub fn lookup(&self, source_id: &SourceId, metric: MetricKind) -> Option<&SourceDescriptor> {
        self.entries.get(&(source_id.clone(), metric))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Confidence used for fusion: the declared confidence capped by the
    /// registered base confidence. Unregistered sources keep their declared
    /// confidence.
    pub fn effective_confidence(&self, observation: &Observation) -> f64 {
        match self.lookup(&observation.source_id, observation.metric) {
            Some(descriptor) => observation
                .declared_confidence
                .min(descriptor.base_confidence),
            None => {
                debug!(
                    source_id = %observation.source_id,
                    metric = %observation.metric,
                    "unregistered source, using declared confidence"
                );
                observation.declared_confidence
            }
        }
    }

    /// Queue a down-weight review. A newer flag for the same source and
    /// metric replaces the older one. Returns true if the queue grew.
    pub fn flag_for_review(&mut self, review: DownweightReview) -> bool {
        let before = self.pending_reviews.len();
        self.pending_reviews.retain(|r| {
            !(r.source_id == review.source_id
                && r.metric == review.metric
                && r.tenant == review.tenant)
        });
        let grew = self.pending_reviews.len() == before;
        self.pending_reviews.push(review);
        grew
    }

    pub fn pending_reviews(&self) -> &[DownweightReview] {
        &self.pending_reviews
    }

    /// Apply a reviewed confidence change and clear matching reviews.
    pub fn apply_review(
        &mut self,
        source_id: &SourceId,
        metric: MetricKind,
        new_confidence: f64,
    ) -> Result<&SourceDescriptor> {
        validate_confidence(new_confidence)?;
        let descriptor = self
            .entries
            .get_mut(&(source_id.clone(), metric))
            .ok_or_else(|| Error::SourceNotFound {
                source_id: source_id.clone(),
                metric,
            })?;
        info!(
            source_id = %source_id,
            %metric,
            from = descriptor.base_confidence,
            to = new_confidence,
            "source confidence revised"
        );
        descriptor.base_confidence = new_confidence;
        self.pending_reviews
            .retain(|r| !(r.source_id == *source_id && r.metric == metric));
        self.describe(source_id, metric)
    }

    /// Drop pending reviews for a source without changing its confidence.
    pub fn dismiss_review(&mut self, source_id: &SourceId, metric: MetricKind) -> usize {
        let before = self.pending_reviews.len();
        self.pending_reviews
            .retain(|r| !(r.source_id == *source_id && r.metric == metric));
        before - self.pending_reviews.len()
    }
}
