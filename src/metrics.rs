//! Prometheus metrics registry (spec.md §6 "Metrics").
//!
//! One `Metrics` instance is built at startup and shared via `Arc` across
//! the pipeline tasks and the health server, each holding its own registered
//! handles rather than reaching for the global default registry from call
//! sites scattered across the codebase.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Bucket boundaries for `post_latency_ms`, in milliseconds.
const POST_LATENCY_BUCKETS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub struct Metrics {
    pub registry: Registry,
    pub lines_processed_total: IntCounter,
    pub parse_errors_total: IntCounter,
    pub queue_depth: IntGauge,
    pub post_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let lines_processed_total = IntCounter::new(
            "lines_processed_total",
            "Classified lines observed by the serial front-end",
        )
        .unwrap();
        let parse_errors_total = IntCounter::new(
            "parse_errors_total",
            "Lines the classifier could not resolve to a known type",
        )
        .unwrap();
        let queue_depth =
            IntGauge::new("queue_depth", "Jobs currently pending in the outbound queue").unwrap();
        let post_latency_ms = Histogram::with_opts(
            HistogramOpts::new("post_latency_ms", "Outbound delivery request latency")
                .buckets(POST_LATENCY_BUCKETS.to_vec()),
        )
        .unwrap();

        registry
            .register(Box::new(lines_processed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(parse_errors_total.clone()))
            .unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry
            .register(Box::new(post_latency_ms.clone()))
            .unwrap();

        Metrics {
            registry,
            lines_processed_total,
            parse_errors_total,
            queue_depth,
            post_latency_ms,
        }
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
