use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_TOTAL: &str = "huddle_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "huddle_api_http_request_duration_seconds";
const HTTP_REQUEST_ERRORS_TOTAL: &str = "huddle_api_http_errors_total";
const IDEMPOTENT_REPLAYS_TOTAL: &str = "huddle_api_idempotent_replays_total";
const MESSAGE_REQUEST_RESOLUTIONS_TOTAL: &str = "huddle_api_message_request_resolutions_total";
const SSE_STREAMS_OPEN: &str = "huddle_api_sse_streams_open";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let status_code = status.as_u16().to_string();
    let result = if status.is_server_error() {
        "error"
    } else {
        "success"
    };

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone(),
        "result" => result
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone()
    )
    .record(elapsed.as_secs_f64());

    if status.is_server_error() {
        counter!(
            HTTP_REQUEST_ERRORS_TOTAL,
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status_code
        )
        .increment(1);
    }
}

pub fn register_idempotent_replay(operation: &str) {
    counter!(IDEMPOTENT_REPLAYS_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn register_request_resolution(outcome: &'static str) {
    counter!(MESSAGE_REQUEST_RESOLUTIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Tracks open SSE streams per feed; the gauge drops when the guard does.
pub struct StreamGuard {
    feed: &'static str,
}

impl StreamGuard {
    pub fn open(feed: &'static str) -> Self {
        gauge!(SSE_STREAMS_OPEN, "feed" => feed).increment(1.0);
        Self { feed }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        gauge!(SSE_STREAMS_OPEN, "feed" => self.feed).decrement(1.0);
    }
}
