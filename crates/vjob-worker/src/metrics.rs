//! Prometheus metrics for the dispatcher.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use vjob_models::JobKind;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "vjob_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vjob_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vjob_jobs_failed_total";
    pub const JOB_DURATION_SECONDS: &str = "vjob_job_duration_seconds";
    pub const JOBS_CANCELLED_TOTAL: &str = "vjob_jobs_cancelled_total";
    pub const MESSAGES_REJECTED_TOTAL: &str = "vjob_messages_rejected_total";
    pub const MESSAGES_RECLAIMED_TOTAL: &str = "vjob_messages_reclaimed_total";
    pub const WEBHOOKS_TOTAL: &str = "vjob_webhooks_total";
}

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

pub fn record_job_started(kind: JobKind) {
    let labels = [("kind", kind.as_str())];
    counter!(names::JOBS_STARTED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed(kind: JobKind, duration_secs: f64) {
    let labels = [("kind", kind.as_str())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a failed job. `reason` is one of `invalid_payload`, `processing`, `unexpected`.
pub fn record_job_failed(kind: JobKind, reason: &'static str, duration_secs: f64) {
    let labels = [("kind", kind.as_str()), ("reason", reason)];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "kind" => kind.as_str()).record(duration_secs);
}

/// Record a job whose message arrived after it was cancelled.
pub fn record_job_cancelled(kind: JobKind) {
    counter!(names::JOBS_CANCELLED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_messages_reclaimed(stream: &'static str, count: usize) {
    counter!(names::MESSAGES_RECLAIMED_TOTAL, "stream" => stream).increment(count as u64);
}

pub fn record_message_rejected(stream: &'static str, reason: &'static str) {
    let labels = [("stream", stream), ("reason", reason)];
    counter!(names::MESSAGES_REJECTED_TOTAL, &labels).increment(1);
}

pub fn record_webhook(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    counter!(names::WEBHOOKS_TOTAL, "outcome" => outcome).increment(1);
}
