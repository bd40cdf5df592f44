//! Core metrics definitions.
//!
//! Names follow Prometheus conventions: `_total` for counters, `_seconds` for
//! durations.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!("strata_stack_starts_total", "Stack start operations (by outcome)");
    describe_counter!("strata_stack_stops_total", "Stack stop operations");
    describe_histogram!(
        "strata_stack_start_duration_seconds",
        "Time from start request until every launched service settled"
    );
    describe_counter!("strata_controllers_created_total", "Controllers submitted to the cluster");
    describe_counter!(
        "strata_controller_failures_total",
        "Controller submissions rejected by the cluster"
    );
    describe_counter!(
        "strata_teardown_failures_total",
        "Best-effort teardown steps that failed (by resource)"
    );
    describe_counter!("strata_reconcile_events_total", "Cluster events applied (by stream)");
    describe_counter!(
        "strata_store_conflicts_total",
        "Optimistic writes retried after a revision conflict"
    );
    describe_counter!("strata_store_errors_total", "Storage failures (by operation)");
    describe_gauge!("strata_stacks_in_flight", "Lifecycle operations currently running");
}

pub fn record_stack_start(outcome: &str, duration_secs: f64) {
    counter!("strata_stack_starts_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("strata_stack_start_duration_seconds").record(duration_secs);
}

pub fn record_stack_stop() {
    counter!("strata_stack_stops_total").increment(1);
}

pub fn record_controller_created() {
    counter!("strata_controllers_created_total").increment(1);
}

pub fn record_controller_failure() {
    counter!("strata_controller_failures_total").increment(1);
}

pub fn record_teardown_failure(resource: &str) {
    counter!("strata_teardown_failures_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_reconcile_event(stream: &str) {
    counter!("strata_reconcile_events_total", "stream" => stream.to_string()).increment(1);
}

pub fn record_store_conflict() {
    counter!("strata_store_conflicts_total").increment(1);
}

pub fn record_store_error(operation: &str) {
    counter!("strata_store_errors_total", "operation" => operation.to_string()).increment(1);
}

pub fn adjust_in_flight(delta: f64) {
    gauge!("strata_stacks_in_flight").increment(delta);
}
