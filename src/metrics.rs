//! Prometheus metrics for the request pipeline.
//!
//! The recorder is owned by [`Metrics`] and passed explicitly to the server;
//! it is never installed as the process-wide `metrics` recorder. Stages record
//! into it through [`metrics::with_local_recorder`].
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `portico_http_requests_total` | Counter | `method`, `status` |
//! | `portico_http_request_duration_seconds` | Histogram | `method` |

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// A Prometheus registry that can be shared between the pipeline and the
/// embedding process.
#[derive(Clone)]
pub struct Metrics {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl Metrics {
    /// Creates a fresh registry with the standard metric descriptions.
    pub fn new() -> Self {
        Self::from_recorder(PrometheusBuilder::new().build_recorder())
    }

    /// Wraps a recorder built by the embedding process.
    pub fn from_recorder(recorder: PrometheusRecorder) -> Self {
        let handle = recorder.handle();
        let metrics = Self {
            recorder: Arc::new(recorder),
            handle,
        };
        metrics.with_recorder(|| {
            describe_counter!(
                "portico_http_requests_total",
                "Total number of HTTP requests processed"
            );
            describe_histogram!(
                "portico_http_request_duration_seconds",
                "HTTP request duration in seconds"
            );
        });
        metrics
    }

    /// Records a completed request.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let method = method_label(method).to_string();
        self.with_recorder(|| {
            counter!(
                "portico_http_requests_total",
                "method" => method.clone(),
                "status" => status.to_string()
            )
            .increment(1);
            histogram!("portico_http_request_duration_seconds", "method" => method)
                .record(duration.as_secs_f64());
        });
    }

    /// Runs `f` with this registry as the active recorder, for callers that
    /// want to emit their own metrics into the exposition.
    pub fn with_recorder<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(self.recorder.as_ref(), f)
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension methods share one label so clients cannot grow the registry.
fn method_label(method: &str) -> &str {
    match method {
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "CONNECT" | "OPTIONS" | "TRACE"
        | "PATCH" => method,
        _ => "other",
    }
}
