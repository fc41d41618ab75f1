//! Prometheus metrics for forwarded traffic.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `bridge_proxy_requests_total` | Counter | `source`, `outcome`, `status` |
//! | `bridge_proxy_upstream_duration_seconds` | Histogram | `source` |
//! | `bridge_proxy_transactions_pending` | Gauge | - |
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::TelemetrySettings;
use crate::error::{ProxyError, ProxyResult};
use crate::model::RequestSource;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it again is a no-op.
pub fn init_metrics(settings: &TelemetrySettings) -> ProxyResult<()> {
    if !settings.metrics_enabled || METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", settings.service_name.clone())
        .install_recorder()
        .map_err(|e| ProxyError::configuration(format!("failed to install metrics recorder: {e}")))?;
    let _ = METRICS_HANDLE.set(handle);

    register_metric_descriptions();
    Ok(())
}

/// Render metrics in Prometheus text format, if the recorder is installed.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(
        "bridge_proxy_requests_total",
        "Inbound requests by source, outcome and response status"
    );
    describe_histogram!(
        "bridge_proxy_upstream_duration_seconds",
        "Duration of outbound calls to bridges and homeservers"
    );
    describe_gauge!(
        "bridge_proxy_transactions_pending",
        "Correlation records currently held"
    );
}

/// Record a completed inbound request.
pub fn record_request(source: RequestSource, outcome: &'static str, status: u16) {
    counter!(
        "bridge_proxy_requests_total",
        "source" => source.as_str(),
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the duration of one outbound call.
pub fn record_upstream(source: RequestSource, duration: Duration) {
    histogram!(
        "bridge_proxy_upstream_duration_seconds",
        "source" => source.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Publish the number of held correlation records.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_transactions(pending: usize) {
    gauge!("bridge_proxy_transactions_pending").set(pending as f64);
}
