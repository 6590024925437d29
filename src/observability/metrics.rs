//! Metrics collection and exposition.
//!
//! # Metrics
//! - `opguard_lock_acquisitions_total` (counter): by outcome (granted, stolen, held)
//! - `opguard_lock_releases_total` (counter): by outcome (released, not_held)
//! - `opguard_circuit_transitions_total` (counter): by dependency, target state
//! - `opguard_circuit_rejections_total` (counter): fail-fast rejections by dependency
//! - `opguard_resource_pressure` (gauge): current 0-100 pressure score
//! - `opguard_emergency_mode` (gauge): 1 while shedding, 0 otherwise
//! - `opguard_load_shed_total` (counter): work refused for resource pressure
//! - `opguard_guard_outcomes_total` (counter): run_exclusive results by outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps tests effect-free
//! - The Prometheus exporter is installed only by the binary

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_lock_acquisition(outcome: &'static str) {
    metrics::counter!("opguard_lock_acquisitions_total", "outcome" => outcome).increment(1);
}

pub fn record_lock_release(released: bool) {
    let outcome = if released { "released" } else { "not_held" };
    metrics::counter!("opguard_lock_releases_total", "outcome" => outcome).increment(1);
}

pub fn record_circuit_transition(dependency: &str, to: &'static str) {
    metrics::counter!(
        "opguard_circuit_transitions_total",
        "dependency" => dependency.to_string(),
        "to" => to
    )
    .increment(1);
}

pub fn record_circuit_rejection(dependency: &str) {
    metrics::counter!(
        "opguard_circuit_rejections_total",
        "dependency" => dependency.to_string()
    )
    .increment(1);
}

pub fn record_pressure(pressure: f64, emergency_mode: bool) {
    metrics::gauge!("opguard_resource_pressure").set(pressure);
    metrics::gauge!("opguard_emergency_mode").set(if emergency_mode { 1.0 } else { 0.0 });
}

pub fn record_load_shed() {
    metrics::counter!("opguard_load_shed_total").increment(1);
}

pub fn record_guard_outcome(outcome: &'static str) {
    metrics::counter!("opguard_guard_outcomes_total", "outcome" => outcome).increment(1);
}
