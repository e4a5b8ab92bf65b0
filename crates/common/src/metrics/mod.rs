//! Metrics and observability utilities
//!
//! Prometheus metrics for the HTTP surface and the generation pipeline,
//! all named `zistudy_*`.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::{Duration, Instant};

/// Metrics prefix for all ZiStudy metrics
pub const METRICS_PREFIX: &str = "zistudy";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
];

/// Buckets for model calls and whole jobs, which run for seconds to minutes
pub const GENERATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );
    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_generation_jobs_submitted_total", METRICS_PREFIX),
        Unit::Count,
        "Generation jobs accepted for processing"
    );
    describe_counter!(
        format!("{}_generation_jobs_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Generation jobs that reached a terminal state, by status"
    );
    describe_histogram!(
        format!("{}_generation_job_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Wall time from claim to terminal state"
    );
    describe_counter!(
        format!("{}_generation_attempts_total", METRICS_PREFIX),
        Unit::Count,
        "Generation attempts, by outcome"
    );
    describe_histogram!(
        format!("{}_model_call_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Latency of one model invocation"
    );
    describe_counter!(
        format!("{}_model_call_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Model invocations that failed or timed out"
    );
    describe_counter!(
        format!("{}_candidates_rejected_total", METRICS_PREFIX),
        Unit::Count,
        "Candidate cards dropped as invalid or duplicate"
    );
    describe_counter!(
        format!("{}_cards_persisted_total", METRICS_PREFIX),
        Unit::Count,
        "Study cards written"
    );
    describe_counter!(
        format!("{}_document_truncations_total", METRICS_PREFIX),
        Unit::Count,
        "Documents cut to fit the context budget"
    );
    describe_counter!(
        format!("{}_documents_skipped_total", METRICS_PREFIX),
        Unit::Count,
        "Uploaded documents that could not be used"
    );
    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Queue messages handled by the worker, by result"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_job_submitted() {
    counter!(format!("{}_generation_jobs_submitted_total", METRICS_PREFIX)).increment(1);
}

pub fn record_job_finished(status: &str, elapsed: Duration) {
    counter!(
        format!("{}_generation_jobs_finished_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generation_job_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_attempt(outcome: &str) {
    counter!(
        format!("{}_generation_attempts_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to record model call metrics
pub fn record_model_call(elapsed: Duration, success: bool) {
    let status = if success { "success" } else { "error" };

    histogram!(
        format!("{}_model_call_duration_seconds", METRICS_PREFIX),
        "status" => status
    )
    .record(elapsed.as_secs_f64());

    if !success {
        counter!(format!("{}_model_call_errors_total", METRICS_PREFIX)).increment(1);
    }
}

pub fn record_candidates_rejected(count: u32) {
    if count > 0 {
        counter!(format!("{}_candidates_rejected_total", METRICS_PREFIX)).increment(u64::from(count));
    }
}

pub fn record_cards_persisted(count: usize) {
    counter!(format!("{}_cards_persisted_total", METRICS_PREFIX)).increment(count as u64);
}

pub fn record_document_truncation() {
    counter!(format!("{}_document_truncations_total", METRICS_PREFIX)).increment(1);
}

pub fn record_document_skipped() {
    counter!(format!("{}_documents_skipped_total", METRICS_PREFIX)).increment(1);
}

pub fn record_queue_message(result: &str) {
    counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        "result" => result.to_string()
    )
    .increment(1);
}
