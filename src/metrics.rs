use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the static cache TTL gauge.
    pub fn init(cache_ttl_secs: u64) -> anyhow::Result<Self> {
        // Default buckets; histograms are rendered as summaries.
        let handle = PrometheusBuilder::new().install_recorder()?;

        ensure_metrics_described();
        gauge!("resilient_cache_ttl_secs").set(cache_ttl_secs as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Describe every series once per process. Safe to call from hot paths.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "resilient_calls_total",
            "Outbound scoring calls by endpoint and final outcome."
        );
        describe_counter!(
            "resilient_retries_total",
            "Retries scheduled after a retryable failure."
        );
        describe_counter!("resilient_cache_hits_total", "Responses served from the TTL cache.");
        describe_counter!(
            "resilient_cache_misses_total",
            "Cacheable calls that had to reach the network."
        );
        describe_counter!("circuit_opened_total", "Circuit breaker transitions into Open.");
        describe_histogram!(
            "resilient_call_ms",
            "Wall time of one resilient call including retries, in milliseconds."
        );
        describe_gauge!("resilient_cache_ttl_secs", "Configured response cache TTL.");
        describe_counter!(
            "ensemble_analyses_total",
            "Ensemble analyses by outcome code."
        );
        describe_counter!(
            "reanalysis_jobs_total",
            "Re-analysis jobs reaching a terminal status."
        );
        describe_gauge!("reanalysis_jobs_active", "Jobs currently queued or running.");
    });
}
