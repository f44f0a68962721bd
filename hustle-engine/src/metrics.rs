//! Prometheus metrics
//!
//! One registry per process, built in `main` and shared by reference. The
//! `/metrics` endpoint renders the text exposition format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use hustle_core::{CoreError, CoreResult};

/// Counters and gauges for the money core.
pub struct CoreMetrics {
    registry: Registry,
    pub invariant_violations: IntCounterVec,
    pub webhook_failures: IntCounter,
    pub webhook_replays: IntCounter,
    pub saga_retries: IntCounterVec,
    pub saga_failures: IntCounterVec,
    pub dlq_depth: IntGauge,
    pub stuck_entities: IntGaugeVec,
    pub worker_latency: HistogramVec,
    pub outbox_oldest_age_seconds: Histogram,
    pub circuit_open: IntGauge,
}

impl CoreMetrics {
    pub fn new() -> CoreResult<Self> {
        let registry = Registry::new();

        let invariant_violations = IntCounterVec::new(
            Opts::new("invariant_violations_total", "Invariant violations by constraint"),
            &["constraint"],
        )
        .map_err(internal)?;
        let webhook_failures = IntCounter::new(
            "webhook_failures_total",
            "Inbound webhooks that failed processing",
        )
        .map_err(internal)?;
        let webhook_replays = IntCounter::new(
            "webhook_replays_total",
            "Inbound webhooks answered from the replay cache",
        )
        .map_err(internal)?;
        let saga_retries = IntCounterVec::new(
            Opts::new("saga_retries_total", "Saga serialization retries by action"),
            &["action"],
        )
        .map_err(internal)?;
        let saga_failures = IntCounterVec::new(
            Opts::new("saga_failures_total", "Saga failures by action"),
            &["action"],
        )
        .map_err(internal)?;
        let dlq_depth =
            IntGauge::new("dlq_depth", "Unresolved dead-letter queue items").map_err(internal)?;
        let stuck_entities = IntGaugeVec::new(
            Opts::new("stuck_entities", "Entities waiting on recovery, by kind"),
            &["kind"],
        )
        .map_err(internal)?;
        let worker_latency = HistogramVec::new(
            HistogramOpts::new("worker_job_seconds", "Outbox job handling latency")
                .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 30.0]),
            &["queue"],
        )
        .map_err(internal)?;
        let outbox_oldest_age_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "outbox_oldest_age_seconds",
                "Age of the oldest unpublished outbox row at sweep time",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0]),
        )
        .map_err(internal)?;
        let circuit_open = IntGauge::new(
            "provider_circuit_open",
            "1 when the payment provider circuit is open",
        )
        .map_err(internal)?;

        for collector in [
            Box::new(invariant_violations.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(webhook_failures.clone()),
            Box::new(webhook_replays.clone()),
            Box::new(saga_retries.clone()),
            Box::new(saga_failures.clone()),
            Box::new(dlq_depth.clone()),
            Box::new(stuck_entities.clone()),
            Box::new(worker_latency.clone()),
            Box::new(outbox_oldest_age_seconds.clone()),
            Box::new(circuit_open.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            invariant_violations,
            webhook_failures,
            webhook_replays,
            saga_retries,
            saga_failures,
            dlq_depth,
            stuck_entities,
            worker_latency,
            outbox_oldest_age_seconds,
            circuit_open,
        })
    }

    /// Count an error against the right counter family.
    pub fn observe_error(&self, err: &CoreError) {
        if let CoreError::InvariantViolation { constraint, .. } = err {
            self.invariant_violations
                .with_label_values(&[constraint.as_str()])
                .inc();
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn internal(e: prometheus::Error) -> CoreError {
    CoreError::Storage(format!("metrics: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_renders_registered_families() {
        let metrics = CoreMetrics::new().unwrap();
        metrics
            .invariant_violations
            .with_label_values(&["INV-4"])
            .inc();
        metrics.dlq_depth.set(3);

        let text = metrics.gather();
        assert!(text.contains("invariant_violations_total"));
        assert!(text.contains("dlq_depth 3"));
    }

    #[test]
    fn observe_error_counts_invariants_only() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.observe_error(&CoreError::invariant("INV-5", "dup"));
        metrics.observe_error(&CoreError::not_found("task", "x"));

        let text = metrics.gather();
        assert!(text.contains(r#"constraint="INV-5""#));
    }
}
