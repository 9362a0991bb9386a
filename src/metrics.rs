//! Metrics registry (C10, ambient): a `prometheus`-backed set of counters,
//! histograms, and gauges, plus a lock-free fixed-width-bucket latency
//! histogram that computes p50/p95/p99 in-process without round-tripping
//! through Prometheus text encoding on every query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, Registry, TextEncoder, opts};

use crate::error::{ProxyError, Result};

const BUCKET_WIDTH: Duration = Duration::from_micros(500);
const BUCKET_COUNT: usize = 20_000; // covers 0..=10s at 500us resolution

/// A fixed-width bucketed histogram updated with a single atomic increment
/// per observation. Cheap enough to call from the hot query path; read back
/// only when a snapshot is requested.
pub struct LatencyHistogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, || AtomicU64::new(0));
        LatencyHistogram {
            buckets,
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let bucket = (elapsed.as_nanos() / BUCKET_WIDTH.as_nanos()).min(BUCKET_COUNT as u128 - 1) as usize;
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the response time at percentile `p` (0.0..=100.0), or `None`
    /// if no observations have been recorded.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * p / 100.0).ceil() as u64;
        let mut seen = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target.max(1) {
                return Some(BUCKET_WIDTH * (i as u32 + 1));
            }
        }
        Some(BUCKET_WIDTH * BUCKET_COUNT as u32)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot consumed by any external dashboard/exporter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_resolver: String,
    pub total_queries: u64,
    pub primary_successes: u64,
    pub fallback_uses: u64,
    pub bypassed: u64,
    pub servfails: u64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub top_failing_domains: Vec<(String, u32)>,
}

pub struct Metrics {
    registry: Registry,

    queries_total: CounterVec,
    resolver_uses: CounterVec,
    servfails: IntCounter,
    upstream_response_time: prometheus::HistogramVec,
    resolver_health: GaugeVec,
    event_sink_dropped: IntCounter,
    active_resolver_index: IntGauge,

    latency: LatencyHistogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            opts!("dnsward_queries_total", "Total client queries handled"),
            &["resolver_tag"],
        )
        .map_err(metrics_err)?;

        let resolver_uses = CounterVec::new(
            opts!("dnsward_resolver_uses_total", "Upstream exchanges attempted per resolver"),
            &["endpoint", "outcome"],
        )
        .map_err(metrics_err)?;

        let servfails = IntCounter::with_opts(opts!(
            "dnsward_servfails_synthesized_total",
            "Responses synthesized after exhausting all candidates"
        ))
        .map_err(metrics_err)?;

        let upstream_response_time = prometheus::HistogramVec::new(
            prometheus::histogram_opts!(
                "dnsward_upstream_response_seconds",
                "Upstream response time in seconds"
            ),
            &["endpoint"],
        )
        .map_err(metrics_err)?;

        let resolver_health = GaugeVec::new(
            opts!("dnsward_resolver_healthy", "1 if the resolver's last probe succeeded"),
            &["endpoint"],
        )
        .map_err(metrics_err)?;

        let event_sink_dropped = IntCounter::with_opts(opts!(
            "dnsward_event_sink_dropped_total",
            "Events dropped because the event sink queue was full"
        ))
        .map_err(metrics_err)?;

        let active_resolver_index = IntGauge::with_opts(opts!(
            "dnsward_active_resolver_index",
            "Index of the currently active resolver (0 = primary)"
        ))
        .map_err(metrics_err)?;

        registry.register(Box::new(queries_total.clone())).map_err(metrics_err)?;
        registry.register(Box::new(resolver_uses.clone())).map_err(metrics_err)?;
        registry.register(Box::new(servfails.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(upstream_response_time.clone()))
            .map_err(metrics_err)?;
        registry.register(Box::new(resolver_health.clone())).map_err(metrics_err)?;
        registry.register(Box::new(event_sink_dropped.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(active_resolver_index.clone()))
            .map_err(metrics_err)?;

        Ok(Metrics {
            registry,
            queries_total,
            resolver_uses,
            servfails,
            upstream_response_time,
            resolver_health,
            event_sink_dropped,
            active_resolver_index,
            latency: LatencyHistogram::new(),
        })
    }

    pub fn record_query(&self, resolver_tag: &str, elapsed: Duration) {
        self.queries_total.with_label_values(&[resolver_tag]).inc();
        self.latency.record(elapsed);
        if resolver_tag == "servfail" {
            self.servfails.inc();
        }
    }

    pub fn record_upstream_attempt(&self, endpoint: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.resolver_uses.with_label_values(&[endpoint, outcome]).inc();
        self.upstream_response_time
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_resolver_health(&self, endpoint: &str, healthy: bool) {
        self.resolver_health
            .with_label_values(&[endpoint])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn set_active_resolver_index(&self, index: usize) {
        self.active_resolver_index.set(index as i64);
    }

    pub fn record_event_dropped(&self) {
        self.event_sink_dropped.inc();
    }

    pub fn encode_prometheus_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(|e| ProxyError::ConfigError(format!("non-utf8 metrics output: {e}")))
    }

    pub fn snapshot(
        &self,
        active_resolver: String,
        total_queries: u64,
        primary_successes: u64,
        fallback_uses: u64,
        bypassed: u64,
        servfails: u64,
        top_failing_domains: Vec<(String, u32)>,
    ) -> MetricsSnapshot {
        let ms = |p: f64| {
            self.latency
                .percentile(p)
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0)
        };
        MetricsSnapshot {
            active_resolver,
            total_queries,
            primary_successes,
            fallback_uses,
            bypassed,
            servfails,
            p50_response_time_ms: ms(50.0),
            p95_response_time_ms: ms(95.0),
            p99_response_time_ms: ms(99.0),
            top_failing_domains,
        }
    }
}

fn metrics_err(e: prometheus::Error) -> ProxyError {
    ProxyError::ConfigError(format!("metrics registry error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_histogram_reports_percentiles_in_order() {
        let hist = LatencyHistogram::new();
        for ms in [1, 2, 3, 10, 100] {
            hist.record(Duration::from_millis(ms));
        }
        let p50 = hist.percentile(50.0).unwrap();
        let p99 = hist.percentile(99.0).unwrap();
        assert!(p50 <= p99);
    }

    #[test]
    fn latency_histogram_empty_returns_none() {
        let hist = LatencyHistogram::new();
        assert!(hist.percentile(50.0).is_none());
    }

    #[test]
    fn metrics_records_query_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_query("primary", Duration::from_millis(5));
        metrics.record_query("servfail", Duration::from_millis(50));
        let text = metrics.encode_prometheus_text().unwrap();
        assert!(text.contains("dnsward_queries_total"));
    }
}
