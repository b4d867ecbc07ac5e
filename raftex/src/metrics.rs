//! Metrics collection for the replication node.
//!
//! Request counts and latencies land in a dedicated Prometheus registry
//! exposed by the metrics listener.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Registry served by the metrics listener.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Requests handled by the node, by method and outcome.
    pub static ref REQUEST_COUNTER: CounterVec = CounterVec::new(
        Opts::new("raftex_requests_total", "requests handled, by method and outcome"),
        &["method", "outcome"]
    )
    .unwrap();

    /// Request handling latency, by method.
    pub static ref REQUEST_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("raftex_request_seconds", "request latency, by method"),
        &["method"]
    )
    .unwrap();
}

/// Registers all collectors with the registry.
pub fn init_registry() {
    let _ = REGISTRY.register(Box::new(REQUEST_COUNTER.clone()));
    let _ = REGISTRY.register(Box::new(REQUEST_LATENCY.clone()));
}

/// Times one request handler and counts it once finished, labeled by how it
/// ended.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = Instant::now();
    let result = handler().await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(status) if status.code() == tonic::Code::Unavailable => "retriable",
        Err(_) => "error",
    };
    REQUEST_COUNTER
        .with_label_values(&[method_name, outcome])
        .inc();
    REQUEST_LATENCY
        .with_label_values(&[method_name])
        .observe(start.elapsed().as_secs_f64());

    result
}
