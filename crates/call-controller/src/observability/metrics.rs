//! Metrics definitions for the Call Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: HTTP methods
//! - `endpoint`: the routed paths plus `/other`
//! - `outcome`: pairing outcomes and `error`
//! - `status`: end-call outcomes and error codes
//! - `kind`: `waiting`, `rooms`

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("cc_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.150, 0.200, 0.300, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("cc_sweep_duration_seconds".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set sweep buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `cc_http_requests_total`, `cc_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status_code` / `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("cc_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("cc_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path onto a bounded label. Every route is static.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/v1/calls/end" => "/v1/calls/end",
        "/v1/health" => "/v1/health",
        "/metrics" => "/metrics",
        _ => "/other",
    }
}

// ============================================================================
// Call Metrics
// ============================================================================

/// Record one pairing pass run by the pairing reaction.
///
/// Metric: `cc_pairing_attempts_total`
/// Labels: `outcome` (`paired`, `no_candidate`, `aborted`, `error`)
pub fn record_pairing_attempt(outcome: &'static str) {
    counter!("cc_pairing_attempts_total", "outcome" => outcome).increment(1);
}

/// Record an end-call request.
///
/// Metric: `cc_end_call_total`
/// Labels: `status` (`ended`, `already_ended`, or the error code)
pub fn record_end_call(status: &'static str) {
    counter!("cc_end_call_total", "status" => status).increment(1);
}

/// Record documents deleted by one sweeper pass.
///
/// Metric: `cc_sweep_deleted_total`
/// Labels: `kind` (`waiting`, `rooms`)
pub fn record_sweep_deleted(kind: &'static str, deleted: usize) {
    counter!("cc_sweep_deleted_total", "kind" => kind)
        .increment(u64::try_from(deleted).unwrap_or(u64::MAX));
}

/// Record the duration of a full sweep.
///
/// Metric: `cc_sweep_duration_seconds`
pub fn record_sweep_duration(duration: Duration) {
    histogram!("cc_sweep_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
        assert_eq!(categorize_status_code(400), "error");
        assert_eq!(categorize_status_code(401), "error");
        assert_eq!(categorize_status_code(403), "error");
        assert_eq!(categorize_status_code(404), "error");
        assert_eq!(categorize_status_code(500), "error");
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/v1/calls/end"), "/v1/calls/end");
        assert_eq!(normalize_endpoint("/v1/health"), "/v1/health");
        assert_eq!(normalize_endpoint("/metrics"), "/metrics");
        assert_eq!(normalize_endpoint("/v1/calls/end/extra"), "/other");
        assert_eq!(normalize_endpoint("/v1/rooms/abc123"), "/other");
    }

    #[test]
    fn test_call_metrics_are_recorded_under_their_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_pairing_attempt("paired");
            record_pairing_attempt("no_candidate");
            record_end_call("ended");
            record_sweep_deleted("waiting", 3);
            record_sweep_deleted("waiting", 2);
            record_sweep_duration(Duration::from_millis(40));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter = |name: &str, label: &str| {
            snapshot.iter().find_map(|(key, _, _, value)| {
                let matches = key.key().name() == name
                    && key.key().labels().any(|l| l.value() == label);
                match value {
                    DebugValue::Counter(count) if matches => Some(*count),
                    _ => None,
                }
            })
        };

        assert_eq!(counter("cc_pairing_attempts_total", "paired"), Some(1));
        assert_eq!(counter("cc_pairing_attempts_total", "no_candidate"), Some(1));
        assert_eq!(counter("cc_end_call_total", "ended"), Some(1));
        assert_eq!(counter("cc_sweep_deleted_total", "waiting"), Some(5));
        assert!(snapshot
            .iter()
            .any(|(key, ..)| key.key().name() == "cc_sweep_duration_seconds"));
    }
}
