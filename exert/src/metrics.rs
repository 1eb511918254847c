//! Prometheus metrics for the exertion engine.
//!
//! All metrics are compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `exert_exertions_completed_total` - Exertions reaching a terminal state
//! - `exert_leases_ended_total` - Leases cancelled, expired or timed out
//!
//! ## Gauges
//! - `exert_space_depth` - Envelopes currently in the exertion space
//!
//! ## Histograms
//! - `exert_exertion_duration_seconds` - Exertion execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for exert metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `kind` (task, job, if, while), `state` (done, failed).
pub static EXERTIONS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "exert_exertions_completed_total",
        "Total number of exertions reaching a terminal state",
    );
    CounterVec::new(opts, &["kind", "state"])
        .expect("exert_exertions_completed_total metric creation failed")
});

/// Labels: `end` (expired, timed_out, cancelled).
pub static LEASES_ENDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("exert_leases_ended_total", "Total number of ended leases");
    CounterVec::new(opts, &["end"]).expect("exert_leases_ended_total metric creation failed")
});

pub static SPACE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("exert_space_depth", "Envelopes currently held in the exertion space")
        .expect("exert_space_depth metric creation failed")
});

/// Labels: `kind`, `state`.
pub static EXERTION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "exert_exertion_duration_seconds",
        "Exertion execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["kind", "state"])
        .expect("exert_exertion_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EXERTIONS_COMPLETED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LEASES_ENDED_TOTAL.clone()),
        Box::new(SPACE_DEPTH.clone()),
        Box::new(EXERTION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_exertion_completed(kind: &str, state: &str, duration_secs: f64) {
    EXERTIONS_COMPLETED_TOTAL
        .with_label_values(&[kind, state])
        .inc();
    EXERTION_DURATION_SECONDS
        .with_label_values(&[kind, state])
        .observe(duration_secs);
}

pub fn record_lease_ended(end: &str) {
    LEASES_ENDED_TOTAL.with_label_values(&[end]).inc();
}

pub fn set_space_depth(depth: f64) {
    SPACE_DEPTH.set(depth);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization is a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_exertion_completed("task", "done", 0.01);
        record_lease_ended("expired");
        set_space_depth(3.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("exert_exertions_completed_total"));
        assert!(output.contains("exert_leases_ended_total"));
        assert!(output.contains("exert_space_depth"));
    }
}
