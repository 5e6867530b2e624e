//! Application metrics for Prometheus monitoring.
//!
//! This module provides:
//! - Prometheus metrics recorder initialization
//! - Metric descriptions for the job pipeline
//! - Helpers for metrics recorded at the HTTP edge

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// This should be called once at application startup, before any metrics are recorded.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    let mut installed = false;
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Failed to set global metrics recorder (already set)");
        } else {
            describe_metrics();
            installed = true;
            tracing::info!("Prometheus metrics initialized");
        }
        handle
    });
    installed
}

fn describe_metrics() {
    describe_counter!(
        "iavatar_jobs_submitted_total",
        "Jobs accepted for generation, by mode (sync or async)"
    );
    describe_counter!(
        "iavatar_jobs_finished_total",
        "Jobs that reached a terminal state, by outcome"
    );
    describe_histogram!(
        "iavatar_inference_duration_seconds",
        "Wall-clock time of one inference execution in seconds"
    );
    describe_counter!(
        "iavatar_jobs_swept_total",
        "Finished async jobs removed after their TTL"
    );
    describe_gauge!(
        "iavatar_admission_slots_available",
        "Free inference slots in the admission gate"
    );
    describe_gauge!(
        "iavatar_jobs_in_state",
        "Jobs currently held in the registry, by non-terminal state"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Record a job accepted at the gateway.
pub fn record_submitted(mode: &'static str) {
    counter!("iavatar_jobs_submitted_total", "mode" => mode).increment(1);
}

/// Publish the gate's initial capacity before any job runs.
pub fn record_slots_available(available: usize) {
    gauge!("iavatar_admission_slots_available").set(available as f64);
}

/// Refresh the registry-derived gauges; called on every scrape.
pub fn record_job_gauges(queued: usize, processing: usize, slots_available: usize) {
    gauge!("iavatar_jobs_in_state", "state" => "queued").set(queued as f64);
    gauge!("iavatar_jobs_in_state", "state" => "processing").set(processing as f64);
    record_slots_available(slots_available);
}
