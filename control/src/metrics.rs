//! Prometheus metrics for the control plane.

use metrics::{counter, histogram};

pub fn cluster_created() {
    counter!("control_clusters_created_total").increment(1);
}

pub fn cluster_updated() {
    counter!("control_clusters_updated_total").increment(1);
}

pub fn cluster_deleted() {
    counter!("control_clusters_deleted_total").increment(1);
}

pub fn nodepool_created() {
    counter!("control_nodepools_created_total").increment(1);
}

pub fn nodepool_updated() {
    counter!("control_nodepools_updated_total").increment(1);
}

pub fn nodepool_deleted() {
    counter!("control_nodepools_deleted_total").increment(1);
}

/// Record a controller report landing for a resource kind.
pub fn status_report_received(kind: &'static str) {
    counter!("control_status_reports_total", "kind" => kind).increment(1);
}

/// Record an aggregate recompute (dirty path).
pub fn status_recomputed(kind: &'static str) {
    counter!("control_status_recomputes_total", "kind" => kind).increment(1);
}

/// Record a cache hit (clean path).
pub fn status_served_cached(kind: &'static str) {
    counter!("control_status_cache_hits_total", "kind" => kind).increment(1);
}

/// Record one reconcile emit with its reason code.
pub fn reconcile_emitted(reason: &'static str) {
    counter!("control_reconcile_events_total", "reason" => reason).increment(1);
}

pub fn event_emitted(event_type: &'static str) {
    counter!("control_events_emitted_total", "event_type" => event_type).increment(1);
}

pub fn publish_failed(event_type: &'static str) {
    counter!("control_publish_failures_total", "event_type" => event_type).increment(1);
}

pub fn db_error(operation: &'static str) {
    counter!("control_db_errors_total", "operation" => operation).increment(1);
}

/// Record one scheduler sweep.
pub fn scheduler_tick(selected: usize, duration_secs: f64) {
    counter!("control_scheduler_ticks_total").increment(1);
    histogram!("control_scheduler_tick_selected").record(selected as f64);
    histogram!("control_scheduler_tick_duration_seconds").record(duration_secs);
}
