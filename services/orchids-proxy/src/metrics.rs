//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `endpoint`
//! - `proxy_request_duration_seconds` (histogram): label `endpoint`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_retries_total` (counter)
//! - `proxy_tokens_total` (counter): label `direction` (`input` | `output`)
//!
//! Pool and token cache gauges are recorded by their own crates.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Streaming responses can run for minutes, so buckets reach 300s.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request. For streams, `duration_secs` covers the time
/// until the response headers were produced.
pub fn record_request(status: u16, endpoint: &str, duration_secs: f64) {
    metrics::counter!(
        "proxy_requests_total",
        "status" => status.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(duration_secs);
}

/// Record a failed upstream attempt, labelled by `ProviderError::kind`.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_retry() {
    metrics::counter!("proxy_retries_total").increment(1);
}

pub fn record_tokens(input: u32, output: u32) {
    metrics::counter!("proxy_tokens_total", "direction" => "input").increment(u64::from(input));
    metrics::counter!("proxy_tokens_total", "direction" => "output").increment(u64::from(output));
}

/// Process-wide counters shared with `/health` and the drain logic
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, including open streams
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
