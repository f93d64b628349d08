//! `/metrics` exposition (spec.md §6): request/latency/probe counters plus a
//! live key-pool-size gauge, rendered through the default Prometheus registry.

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
    HistogramOpts,
};

/// Owns a private registry rather than the process-wide default one, so a
/// test (or an embedder) can build more than one `AppContext` per process
/// without a duplicate-registration panic.
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub key_pool_size: IntGaugeVec,
    pub probe_total: IntCounterVec,
    pub latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total inbound gateway requests by provider and outcome status"),
            &["provider", "status"],
        )
        .expect("build gateway_requests_total");
        let key_pool_size = IntGaugeVec::new(
            Opts::new("gateway_key_pool_size", "Current size of the live key pool for a provider/model"),
            &["provider", "model"],
        )
        .expect("build gateway_key_pool_size");
        let probe_total = IntCounterVec::new(
            Opts::new("worker_probe_total", "Total probe attempts by provider and resulting reason"),
            &["provider", "reason"],
        )
        .expect("build worker_probe_total");
        let latency_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_latency_seconds", "Upstream request latency in seconds by provider"),
            &["provider"],
        )
        .expect("build gateway_latency_seconds");

        registry.register(Box::new(requests_total.clone())).expect("register gateway_requests_total");
        registry.register(Box::new(key_pool_size.clone())).expect("register gateway_key_pool_size");
        registry.register(Box::new(probe_total.clone())).expect("register worker_probe_total");
        registry.register(Box::new(latency_seconds.clone())).expect("register gateway_latency_seconds");

        Self { registry, requests_total, key_pool_size, probe_total, latency_seconds }
    }

    /// Renders this instance's registry in the Prometheus text exposition format.
    pub fn encode(&self) -> (String, Vec<u8>) {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).expect("encode prometheus metrics");
        (encoder.format_type().to_string(), buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
