//! The `/metrics` surface: admission, correlation, queue, commit and
//! rule-store gauges/counters, all registered against one
//! `prometheus_client::Registry` built once at startup and handed to
//! every component that needs to record against it.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::correlation::EvictionReason;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DestinationLabel {
    pub destination: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabel {
    pub namespace: String,
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub admission_requests_total: Counter,
    pub admission_matched_rules: Histogram,
    pub correlation_misses_total: Counter,
    pub correlation_evictions_total: Family<ReasonLabel, Counter>,
    pub correlation_size: Gauge,
    pub events_queued_total: Counter,
    pub events_dropped_total: Family<ReasonLabel, Counter>,
    pub commits_total: Family<DestinationLabel, Counter>,
    pub commit_push_failures_total: Family<DestinationLabel, Counter>,
    pub commit_push_conflicts_total: Family<DestinationLabel, Counter>,
    pub worker_queue_depth: Family<DestinationLabel, Gauge>,
    pub destination_ready: Family<DestinationLabel, Gauge>,
    pub rules_total: Family<NamespaceLabel, Gauge>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("gitmirror");

        let admission_requests_total = Counter::default();
        registry.register("admission_requests", "admission review requests received", admission_requests_total.clone());

        let admission_matched_rules = Histogram::new([0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0].into_iter());
        registry.register("admission_matched_rules", "rules matched per admission request", admission_matched_rules.clone());

        let correlation_misses_total = Counter::default();
        registry.register("correlation_misses", "watch events with no matching correlation entry", correlation_misses_total.clone());

        let correlation_evictions_total = Family::<ReasonLabel, Counter>::default();
        registry.register("correlation_evictions", "correlation store entries evicted before use", correlation_evictions_total.clone());

        let correlation_size = Gauge::default();
        registry.register("correlation_size", "entries currently held in the correlation store", correlation_size.clone());

        let events_queued_total = Counter::default();
        registry.register("events_queued", "events pushed onto the event queue", events_queued_total.clone());

        let events_dropped_total = Family::<ReasonLabel, Counter>::default();
        registry.register("events_dropped", "events discarded before reaching a commit", events_dropped_total.clone());

        let commits_total = Family::<DestinationLabel, Counter>::default();
        registry.register("commits", "git commits produced, by destination", commits_total.clone());

        let commit_push_failures_total = Family::<DestinationLabel, Counter>::default();
        registry.register("commit_push_failures", "push retries exhausted, by destination", commit_push_failures_total.clone());

        let commit_push_conflicts_total = Family::<DestinationLabel, Counter>::default();
        registry.register("commit_push_conflicts", "non-fast-forward pushes recovered via rebase, by destination", commit_push_conflicts_total.clone());

        let worker_queue_depth = Family::<DestinationLabel, Gauge>::default();
        registry.register("worker_queue_depth", "staged paths awaiting a flush, by destination", worker_queue_depth.clone());

        let destination_ready = Family::<DestinationLabel, Gauge>::default();
        registry.register("destination_ready", "1 if the destination's commit worker is healthy", destination_ready.clone());

        let rules_total = Family::<NamespaceLabel, Gauge>::default();
        registry.register("rules", "compiled watch rules held by the rule store, by source namespace", rules_total.clone());

        Self {
            registry: Arc::new(registry),
            admission_requests_total,
            admission_matched_rules,
            correlation_misses_total,
            correlation_evictions_total,
            correlation_size,
            events_queued_total,
            events_dropped_total,
            commits_total,
            commit_push_failures_total,
            commit_push_conflicts_total,
            worker_queue_depth,
            destination_ready,
            rules_total,
        }
    }
}

impl Metrics {
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut buffer, &self.registry);
        buffer
    }

    /// Folds `CorrelationStore::drain_evictions()`'s reasons into
    /// `correlation_evictions_total{reason}`.
    pub fn record_evictions(&self, reasons: &[EvictionReason]) {
        for reason in reasons {
            let label = match reason {
                EvictionReason::Ttl => "ttl",
                EvictionReason::Lru => "lru",
                EvictionReason::QueueDepth => "queue_depth",
            };
            self.correlation_evictions_total.get_or_create(&ReasonLabel { reason: label.to_owned() }).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_openmetrics_text() {
        let metrics = Metrics::default();
        metrics.admission_requests_total.inc();
        metrics
            .commits_total
            .get_or_create(&DestinationLabel { destination: "default/dest".into() })
            .inc();
        let text = metrics.encode();
        assert!(text.contains("gitmirror_admission_requests_total"));
        assert!(text.contains("destination=\"default/dest\""));
    }

    #[test]
    fn record_evictions_increments_by_reason() {
        let metrics = Metrics::default();
        metrics.record_evictions(&[EvictionReason::Ttl, EvictionReason::Lru, EvictionReason::Ttl]);
        let text = metrics.encode();
        assert!(text.contains("reason=\"ttl\""));
        assert!(text.contains("reason=\"lru\""));
    }
}
